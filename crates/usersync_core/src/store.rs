//! Keyed, persisted, observable model store.

use crate::error::{CoreError, CoreResult};
use crate::model::{Model, ModelChangeTag, PropertyChange, StoreModel};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use usersync_storage::{keys, PreferenceStore};

/// Identifies a subscribed change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Describes one property change of a stored model.
#[derive(Debug, Clone)]
pub struct ModelChangedArgs<M> {
    /// A copy of the model after the change.
    pub model: M,
    /// Full path of the changed value.
    pub path: String,
    /// Top-level property name.
    pub property: String,
    /// Value before the change.
    pub old_value: crate::value::PropertyValue,
    /// Value after the change.
    pub new_value: crate::value::PropertyValue,
}

impl<M: Clone> ModelChangedArgs<M> {
    pub(crate) fn new(model: &M, change: PropertyChange) -> Self {
        Self {
            model: model.clone(),
            path: change.path,
            property: change.property,
            old_value: change.old_value,
            new_value: change.new_value,
        }
    }
}

/// Receives change notifications from a [`ModelStore`].
///
/// Handlers run synchronously on the mutating thread, after the change is
/// persisted. They may read the store and may mutate it again.
pub trait ModelStoreChangeHandler<M>: Send + Sync {
    /// A model was added.
    fn on_model_added(&self, model: &M, tag: ModelChangeTag);

    /// A property of a stored model changed.
    fn on_model_updated(&self, args: &ModelChangedArgs<M>, tag: ModelChangeTag);

    /// A model was removed.
    fn on_model_removed(&self, model: &M, tag: ModelChangeTag);
}

enum StoreEvent<M> {
    Added(M),
    Updated(ModelChangedArgs<M>),
    Removed(M),
}

/// Handler registry shared by both store flavours.
pub(crate) struct Handlers<H: ?Sized> {
    entries: RwLock<Vec<(HandlerId, Arc<H>)>>,
    next_id: AtomicU64,
    // Serializes notification rounds so subscribers observe mutations in
    // order. Reentrant so a handler may mutate the store it listens to.
    pub(crate) notify_lock: ReentrantMutex<()>,
}

impl<H: ?Sized> Handlers<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notify_lock: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn subscribe(&self, handler: Arc<H>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Reads a persisted model list.
pub(crate) fn load_models<M: StoreModel>(
    prefs: &dyn PreferenceStore,
    name: &str,
) -> CoreResult<Vec<M>> {
    let Some(raw) = prefs.get_string(keys::SCOPE, &keys::model_store(name))? else {
        return Ok(Vec::new());
    };
    let json: serde_json::Value = serde_json::from_str(&raw)?;
    let serde_json::Value::Array(items) = json else {
        return Err(CoreError::invalid_document(format!(
            "model store {name} is not a list"
        )));
    };
    items
        .into_iter()
        .map(|item| Model::from_json(item).map(M::from_model))
        .collect()
}

/// Writes a model list.
pub(crate) fn save_models<M: StoreModel>(
    prefs: &dyn PreferenceStore,
    name: &str,
    models: &[M],
) -> CoreResult<()> {
    let items: Vec<serde_json::Value> = models.iter().map(|m| m.model().to_json()).collect();
    let raw = serde_json::to_string(&items)?;
    prefs.set_string(keys::SCOPE, &keys::model_store(name), Some(&raw))?;
    Ok(())
}

/// A keyed collection of models.
///
/// Models are keyed by their `id` property and kept in insertion order.
/// Every mutation writes the full collection to the preference store
/// before returning, then notifies subscribers.
///
/// # Persistence failures
///
/// A failed write is logged and the in-memory collection stays
/// authoritative; the next successful mutation persists it.
pub struct ModelStore<M: StoreModel> {
    name: String,
    prefs: Option<Arc<dyn PreferenceStore>>,
    models: Mutex<Vec<M>>,
    handlers: Handlers<dyn ModelStoreChangeHandler<M>>,
}

impl<M: StoreModel> ModelStore<M> {
    /// Creates a store named `name`, loading any persisted models.
    ///
    /// A persisted document that cannot be decoded is logged and ignored.
    pub fn new(name: impl Into<String>, prefs: Option<Arc<dyn PreferenceStore>>) -> Self {
        let name = name.into();
        let models = match prefs.as_deref() {
            Some(prefs) => load_models(prefs, &name).unwrap_or_else(|e| {
                tracing::warn!(store = %name, error = %e, "discarding unreadable model store");
                Vec::new()
            }),
            None => Vec::new(),
        };

        Self {
            name,
            prefs,
            models: Mutex::new(models),
            handlers: Handlers::new(),
        }
    }

    /// Creates a store that is never persisted.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a copy of the model stored under `key`.
    pub fn get(&self, key: &str) -> Option<M> {
        self.models
            .lock()
            .iter()
            .find(|m| m.key() == Some(key))
            .cloned()
    }

    /// Returns the model stored under `key`, adding a default one first if
    /// none exists.
    pub fn get_or_create(&self, key: &str, tag: ModelChangeTag) -> M {
        if let Some(model) = self.get(key) {
            return model;
        }
        let mut model = M::default();
        model.model_mut().set("id", key);
        model.model_mut().take_changes();
        self.add(model.clone(), tag);
        self.get(key).unwrap_or(model)
    }

    /// Returns copies of all models, in insertion order.
    pub fn list(&self) -> Vec<M> {
        self.models.lock().clone()
    }

    /// Returns the number of models.
    pub fn len(&self) -> usize {
        self.models.lock().len()
    }

    /// Returns true if the store holds no models.
    pub fn is_empty(&self) -> bool {
        self.models.lock().is_empty()
    }

    /// Appends a model.
    ///
    /// Returns false, without change, if the model has no key or its key is
    /// already present.
    pub fn add(&self, model: M, tag: ModelChangeTag) -> bool {
        let len = self.len();
        self.add_at(len, model, tag)
    }

    /// Inserts a model at `index` (clamped to the current length).
    pub fn add_at(&self, index: usize, mut model: M, tag: ModelChangeTag) -> bool {
        let _notify = self.handlers.notify_lock.lock();
        {
            let mut models = self.models.lock();
            let Some(key) = model.key() else {
                tracing::warn!(store = %self.name, "refusing to add a model without an id");
                return false;
            };
            if models.iter().any(|m| m.key() == Some(key)) {
                tracing::warn!(store = %self.name, key, "refusing to add a duplicate model");
                return false;
            }
            model.model_mut().take_changes();
            let index = index.min(models.len());
            models.insert(index, model.clone());
            self.persist_locked(&models);
        }
        self.dispatch(vec![StoreEvent::Added(model)], tag);
        true
    }

    /// Applies `mutate` to the model stored under `key`.
    ///
    /// Each recorded property change is reported to subscribers. Returns
    /// false if no model has that key.
    pub fn update<F>(&self, key: &str, tag: ModelChangeTag, mutate: F) -> bool
    where
        F: FnOnce(&mut M),
    {
        let _notify = self.handlers.notify_lock.lock();
        let events = {
            let mut models = self.models.lock();
            let Some(model) = models.iter_mut().find(|m| m.key() == Some(key)) else {
                return false;
            };
            mutate(model);
            let changes = model.model_mut().take_changes();
            if changes.is_empty() {
                return true;
            }
            let snapshot = model.clone();
            let events: Vec<_> = changes
                .into_iter()
                .map(|c| StoreEvent::Updated(ModelChangedArgs::new(&snapshot, c)))
                .collect();
            self.persist_locked(&models);
            events
        };
        self.dispatch(events, tag);
        true
    }

    /// Removes the model stored under `key`.
    pub fn remove(&self, key: &str, tag: ModelChangeTag) -> Option<M> {
        let _notify = self.handlers.notify_lock.lock();
        let removed = {
            let mut models = self.models.lock();
            let index = models.iter().position(|m| m.key() == Some(key))?;
            let removed = models.remove(index);
            self.persist_locked(&models);
            removed
        };
        self.dispatch(vec![StoreEvent::Removed(removed.clone())], tag);
        Some(removed)
    }

    /// Removes every model.
    pub fn clear(&self, tag: ModelChangeTag) {
        let _notify = self.handlers.notify_lock.lock();
        let removed = {
            let mut models = self.models.lock();
            let removed = std::mem::take(&mut *models);
            self.persist_locked(&models);
            removed
        };
        self.dispatch(removed.into_iter().map(StoreEvent::Removed).collect(), tag);
    }

    /// Replaces the whole collection.
    ///
    /// Subscribers see a removal for every old model followed by an
    /// addition for every new one. Models without a key, or repeating an
    /// earlier key, are skipped.
    pub fn replace_all(&self, new_models: Vec<M>, tag: ModelChangeTag) {
        let _notify = self.handlers.notify_lock.lock();
        let events = {
            let mut models = self.models.lock();
            let removed = std::mem::take(&mut *models);
            for mut model in new_models {
                let Some(key) = model.key() else { continue };
                if models.iter().any(|m| m.key() == Some(key)) {
                    continue;
                }
                model.model_mut().take_changes();
                models.push(model);
            }
            self.persist_locked(&models);

            removed
                .into_iter()
                .map(StoreEvent::Removed)
                .chain(models.iter().cloned().map(StoreEvent::Added))
                .collect()
        };
        self.dispatch(events, tag);
    }

    /// Subscribes a change handler.
    pub fn subscribe(&self, handler: Arc<dyn ModelStoreChangeHandler<M>>) -> HandlerId {
        self.handlers.subscribe(handler)
    }

    /// Unsubscribes a change handler. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.handlers.unsubscribe(id)
    }

    /// Returns the number of subscribed handlers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Writes the current collection to the preference store.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be encoded or written.
    pub fn persist(&self) -> CoreResult<()> {
        let models = self.models.lock();
        match self.prefs.as_deref() {
            Some(prefs) => save_models(prefs, &self.name, &models),
            None => Ok(()),
        }
    }

    fn persist_locked(&self, models: &[M]) {
        if let Some(prefs) = self.prefs.as_deref() {
            if let Err(e) = save_models(prefs, &self.name, models) {
                tracing::error!(store = %self.name, error = %e, "failed to persist model store");
            }
        }
    }

    fn dispatch(&self, events: Vec<StoreEvent<M>>, tag: ModelChangeTag) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.snapshot();
        for event in &events {
            for handler in &handlers {
                match event {
                    StoreEvent::Added(model) => handler.on_model_added(model, tag),
                    StoreEvent::Updated(args) => handler.on_model_updated(args, tag),
                    StoreEvent::Removed(model) => handler.on_model_removed(model, tag),
                }
            }
        }
    }
}
