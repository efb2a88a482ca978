//! Single-model store (config, identity, properties, session).

use crate::error::CoreResult;
use crate::model::{ModelChangeTag, StoreModel};
use crate::store::{load_models, save_models, HandlerId, Handlers, ModelChangedArgs};
use parking_lot::Mutex;
use std::sync::Arc;
use usersync_storage::PreferenceStore;

/// Receives change notifications from a [`SingletonModelStore`].
pub trait SingletonModelStoreChangeHandler<M>: Send + Sync {
    /// The model was replaced wholesale.
    fn on_model_replaced(&self, model: &M, tag: ModelChangeTag);

    /// A property of the model changed.
    fn on_model_updated(&self, args: &ModelChangedArgs<M>, tag: ModelChangeTag);
}

/// A store that owns exactly one model.
///
/// The model is created with defaults on first access. It is persisted in
/// the same list format as a keyed [`crate::ModelStore`], so a document
/// written by either flavour can be read by tooling without knowing which
/// one produced it.
pub struct SingletonModelStore<M: StoreModel> {
    name: String,
    prefs: Option<Arc<dyn PreferenceStore>>,
    model: Mutex<Option<M>>,
    handlers: Handlers<dyn SingletonModelStoreChangeHandler<M>>,
}

impl<M: StoreModel> SingletonModelStore<M> {
    /// Creates a store named `name`, loading any persisted model.
    pub fn new(name: impl Into<String>, prefs: Option<Arc<dyn PreferenceStore>>) -> Self {
        let name = name.into();
        let model = match prefs.as_deref() {
            Some(prefs) => match load_models::<M>(prefs, &name) {
                Ok(mut models) if !models.is_empty() => Some(models.swap_remove(0)),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(store = %name, error = %e, "discarding unreadable model store");
                    None
                }
            },
            None => None,
        };

        Self {
            name,
            prefs,
            model: Mutex::new(model),
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

    /// Returns a copy of the model, creating and persisting a default one
    /// on first access.
    pub fn model(&self) -> M {
        let mut slot = self.model.lock();
        if let Some(model) = slot.as_ref() {
            return model.clone();
        }
        let model = M::default();
        *slot = Some(model.clone());
        self.persist_locked(slot.as_ref());
        model
    }

    /// Applies `mutate` to the model and reports each recorded change.
    pub fn update<F>(&self, tag: ModelChangeTag, mutate: F)
    where
        F: FnOnce(&mut M),
    {
        let _notify = self.handlers.notify_lock.lock();
        let events = {
            let mut slot = self.model.lock();
            let model = slot.get_or_insert_with(M::default);
            mutate(model);
            let changes = model.model_mut().take_changes();
            if changes.is_empty() {
                return;
            }
            let snapshot = model.clone();
            let events: Vec<_> = changes
                .into_iter()
                .map(|c| ModelChangedArgs::new(&snapshot, c))
                .collect();
            self.persist_locked(slot.as_ref());
            events
        };

        let handlers = self.handlers.snapshot();
        for args in &events {
            for handler in &handlers {
                handler.on_model_updated(args, tag);
            }
        }
    }

    /// Replaces the model wholesale.
    pub fn replace(&self, mut model: M, tag: ModelChangeTag) {
        let _notify = self.handlers.notify_lock.lock();
        model.model_mut().take_changes();
        {
            let mut slot = self.model.lock();
            *slot = Some(model.clone());
            self.persist_locked(slot.as_ref());
        }

        for handler in self.handlers.snapshot() {
            handler.on_model_replaced(&model, tag);
        }
    }

    /// Subscribes a change handler.
    pub fn subscribe(&self, handler: Arc<dyn SingletonModelStoreChangeHandler<M>>) -> HandlerId {
        self.handlers.subscribe(handler)
    }

    /// Unsubscribes a change handler. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.handlers.unsubscribe(id)
    }

    /// Writes the model to the preference store.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be encoded or written.
    pub fn persist(&self) -> CoreResult<()> {
        let slot = self.model.lock();
        match (self.prefs.as_deref(), slot.as_ref()) {
            (Some(prefs), Some(model)) => save_models(prefs, &self.name, std::slice::from_ref(model)),
            _ => Ok(()),
        }
    }

    fn persist_locked(&self, model: Option<&M>) {
        let (Some(prefs), Some(model)) = (self.prefs.as_deref(), model) else {
            return;
        };
        if let Err(e) = save_models(prefs, &self.name, std::slice::from_ref(model)) {
            tracing::error!(store = %self.name, error = %e, "failed to persist model store");
        }
    }
}
