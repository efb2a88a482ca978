//! Composition root.

use crate::backend::Backends;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::executor::ExecutorContext;
use crate::listeners::subscribe_listeners;
use crate::new_records::NewRecordsState;
use crate::operation::{now_millis, Operation};
use crate::rebuild::RebuildService;
use crate::repository::OperationRepository;
use crate::stores::UserStores;
use std::sync::Arc;
use std::time::Duration;
use usersync_core::id::{create_local_id, is_local_id};
use usersync_core::{
    wait_with_timeout, ConsistencyManager, IdentityModel, ModelChangeTag, PropertiesModel,
    RywToken, SegmentationReadyCondition, SubscriptionModel, SubscriptionType,
};
use usersync_storage::PreferenceStore;

/// The user sync core.
///
/// Owns the user stores, the operation queue with its executors, the
/// consistency manager and the store listeners. Application code edits
/// the current user through the methods here (or directly through the
/// stores with [`ModelChangeTag::Normal`]); the edits reach the backend
/// through the queue.
///
/// # Example
///
/// ```rust,ignore
/// let core = UserSyncCore::open(SyncConfig::default(), "my-app", Some(prefs), backends)?;
/// core.start()?;
/// core.login("user-42")?;
/// core.add_tag("level", "3");
/// let token = core.wait_for_segmentation_ready(Duration::from_secs(5)).await;
/// core.shutdown().await;
/// ```
pub struct UserSyncCore {
    stores: Arc<UserStores>,
    consistency: Arc<ConsistencyManager>,
    repository: Arc<OperationRepository>,
}

impl UserSyncCore {
    /// Builds the core for `app_id`, loading persisted state from `prefs`.
    ///
    /// Without a persisted user, or when the persisted user belongs to a
    /// different app, a fresh anonymous user is created and its login
    /// queued. The queue does not run until [`UserSyncCore::start`].
    pub fn open(
        config: SyncConfig,
        app_id: &str,
        prefs: Option<Arc<dyn PreferenceStore>>,
        backends: Backends,
    ) -> SyncResult<Self> {
        if app_id.is_empty() {
            return Err(SyncError::MissingAppId);
        }

        let stores = Arc::new(UserStores::open(prefs.clone()));
        let previous_app = stores.app_id();
        stores
            .config
            .update(ModelChangeTag::NoPropagate, |c| c.set_app_id(app_id));

        let consistency = Arc::new(ConsistencyManager::new());
        let new_records = Arc::new(NewRecordsState::new(
            config.post_create_delay,
            config.missing_retry_window,
        ));
        let context = ExecutorContext {
            backends,
            stores: Arc::clone(&stores),
            consistency: Arc::clone(&consistency),
            new_records: Arc::clone(&new_records),
            rebuild: Arc::new(RebuildService::new(Arc::clone(&stores))),
        };
        let repository = OperationRepository::new(config, context.executors(), new_records, prefs);
        subscribe_listeners(&stores, &repository);

        let core = Self {
            stores,
            consistency,
            repository,
        };

        let app_changed = previous_app.is_some_and(|previous| previous != app_id);
        if app_changed {
            tracing::info!(app_id, "app id changed; starting over with a new user");
            core.stores.subscriptions.clear(ModelChangeTag::NoPropagate);
            core.stores
                .config
                .update(ModelChangeTag::NoPropagate, |c| c.set_push_subscription_id(None));
        }
        if app_changed || core.stores.current_onesignal_id().is_none() {
            core.switch_user(None);
        }

        tracing::info!(
            app_id,
            onesignal_id = ?core.stores.current_onesignal_id(),
            pending = core.repository.len(),
            "user sync core opened"
        );
        Ok(core)
    }

    /// Starts draining the queue. Requires a tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        self.repository.start()
    }

    /// Stops the queue after the batches in flight complete.
    pub async fn shutdown(&self) {
        self.repository.shutdown().await;
    }

    /// Returns the user stores.
    pub fn stores(&self) -> &Arc<UserStores> {
        &self.stores
    }

    /// Returns the operation queue.
    pub fn repository(&self) -> &Arc<OperationRepository> {
        &self.repository
    }

    /// Returns the consistency manager.
    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }

    /// Returns the current user's id (local until the user is created).
    pub fn onesignal_id(&self) -> Option<String> {
        self.stores.current_onesignal_id()
    }

    /// Returns the current user's external id.
    pub fn external_id(&self) -> Option<String> {
        self.stores.identity.model().external_id().map(str::to_string)
    }

    /// Switches to the user identified by `external_id`.
    ///
    /// An anonymous current user is identified in place; otherwise a new
    /// user is created and the device's push subscription moved to it.
    /// Logging in as the current external id does nothing.
    pub fn login(&self, external_id: &str) -> SyncResult<()> {
        let identity = self.stores.identity.model();
        if identity.external_id() == Some(external_id) {
            tracing::debug!(external_id, "already logged in");
            return Ok(());
        }
        let existing = match identity.external_id() {
            None => identity.onesignal_id().map(str::to_string),
            Some(_) => None,
        };
        tracing::info!(external_id, anonymous = ?existing, "logging in");
        self.switch_user_from(Some(external_id), existing.as_deref())
    }

    /// Switches to a new anonymous user.
    ///
    /// Does nothing if the current user is already anonymous.
    pub fn logout(&self) -> SyncResult<()> {
        if self.stores.identity.model().external_id().is_none() {
            tracing::debug!("already anonymous");
            return Ok(());
        }
        tracing::info!("logging out");
        self.switch_user_from(None, None)
    }

    fn switch_user(&self, external_id: Option<&str>) {
        if let Err(e) = self.switch_user_from(external_id, None) {
            tracing::error!(error = %e, "failed to create a user");
        }
    }

    fn switch_user_from(&self, external_id: Option<&str>, existing: Option<&str>) -> SyncResult<()> {
        let app_id = self.stores.app_id().ok_or(SyncError::MissingAppId)?;
        let local = create_local_id();

        let mut identity = IdentityModel::with_onesignal_id(&local);
        identity.set_external_id(external_id);
        self.stores
            .identity
            .replace(identity, ModelChangeTag::NoPropagate);
        self.stores.properties.replace(
            PropertiesModel::with_onesignal_id(&local),
            ModelChangeTag::NoPropagate,
        );
        let push = self.stores.push_subscription();
        self.stores
            .subscriptions
            .replace_all(push.iter().cloned().collect(), ModelChangeTag::NoPropagate);

        // Waits registered for the previous user will never be met.
        self.consistency
            .resolve_conditions_with_id(SegmentationReadyCondition::ID);

        self.repository
            .enqueue(Operation::login_user(&app_id, &local, external_id, existing), true);
        if existing.is_none() {
            if let Some(push_id) = push.as_ref().and_then(SubscriptionModel::id) {
                self.repository
                    .enqueue(Operation::transfer_subscription(&app_id, &local, push_id), true);
            }
        }
        Ok(())
    }

    /// Sets a tag on the current user.
    pub fn add_tag(&self, key: &str, value: &str) {
        self.stores
            .properties
            .update(ModelChangeTag::Normal, |m| m.set_tag(key, Some(value)));
    }

    /// Removes a tag from the current user.
    pub fn remove_tag(&self, key: &str) {
        self.stores
            .properties
            .update(ModelChangeTag::Normal, |m| m.set_tag(key, None));
    }

    /// Sets the current user's language.
    pub fn set_language(&self, language: Option<&str>) {
        self.stores
            .properties
            .update(ModelChangeTag::Normal, |m| m.set_language(language));
    }

    /// Adds an alias to the current user. Reserved labels are refused.
    pub fn add_alias(&self, label: &str, id: &str) -> bool {
        if is_reserved_alias(label) {
            tracing::warn!(label, "refusing to set a reserved alias");
            return false;
        }
        self.stores
            .identity
            .update(ModelChangeTag::Normal, |m| m.set_alias(label, Some(id)));
        true
    }

    /// Removes an alias from the current user. Reserved labels are refused.
    pub fn remove_alias(&self, label: &str) -> bool {
        if is_reserved_alias(label) {
            tracing::warn!(label, "refusing to remove a reserved alias");
            return false;
        }
        self.stores
            .identity
            .update(ModelChangeTag::Normal, |m| m.set_alias(label, None));
        true
    }

    /// Creates or updates this device's push subscription. Returns its id.
    pub fn set_push_subscription(&self, token: &str, opted_in: bool) -> String {
        if let Some(push) = self.stores.push_subscription() {
            if let Some(id) = push.id().map(str::to_string) {
                self.stores
                    .subscriptions
                    .update(&id, ModelChangeTag::Normal, |m| {
                        m.set_address(token);
                        m.set_opted_in(opted_in);
                    });
                return id;
            }
        }
        let id = create_local_id();
        // The id is recorded first so the create is seen as the push one.
        self.stores
            .config
            .update(ModelChangeTag::NoPropagate, |c| c.set_push_subscription_id(Some(&id)));
        self.stores.subscriptions.add(
            SubscriptionModel::new(&id, SubscriptionType::Push, token, opted_in, SubscriptionModel::SUBSCRIBED),
            ModelChangeTag::Normal,
        );
        id
    }

    /// Adds an email or SMS subscription to the current user. Returns its
    /// local id.
    pub fn add_subscription(&self, kind: SubscriptionType, address: &str) -> String {
        let id = create_local_id();
        self.stores.subscriptions.add(
            SubscriptionModel::new(&id, kind, address, true, SubscriptionModel::SUBSCRIBED),
            ModelChangeTag::Normal,
        );
        id
    }

    /// Removes a subscription. Returns false if it is unknown.
    pub fn remove_subscription(&self, subscription_id: &str) -> bool {
        self.stores
            .subscriptions
            .remove(subscription_id, ModelChangeTag::Normal)
            .is_some()
    }

    /// Queues a re-read of the current user.
    pub fn refresh_user(&self) {
        if let (Some(app_id), Some(onesignal_id)) = (self.stores.app_id(), self.onesignal_id()) {
            self.repository
                .enqueue(Operation::refresh_user(&app_id, &onesignal_id), true);
        }
    }

    /// Opens a new session.
    pub fn start_session(&self) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.stores.session.update(ModelChangeTag::NoPropagate, |s| {
            s.start(&session_id, now_millis())
        });
        tracing::debug!(%session_id, "session started");
        session_id
    }

    /// Closes the current session.
    pub fn end_session(&self) {
        self.stores
            .session
            .update(ModelChangeTag::NoPropagate, |s| s.end());
    }

    /// Waits until the backend reflects the current user's writes, for at
    /// most `timeout`.
    ///
    /// Returns the newest token seen, or `None` on timeout or user switch;
    /// callers proceed either way.
    pub async fn wait_for_segmentation_ready(&self, timeout: Duration) -> Option<RywToken> {
        let onesignal_id = self.onesignal_id()?;
        let requires_subscription = !is_local_id(&onesignal_id)
            && self
                .repository
                .any_pending(|op| op.onesignal_id == onesignal_id && op.is_subscription_operation());
        let future = self
            .consistency
            .register_condition(SegmentationReadyCondition::new(&onesignal_id, requires_subscription));
        wait_with_timeout(future, timeout).await
    }
}

fn is_reserved_alias(label: &str) -> bool {
    label == IdentityModel::ONESIGNAL_ID || label == IdentityModel::EXTERNAL_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::operation::{OperationKind, OperationName};
    use usersync_storage::InMemoryPreferences;

    fn open(prefs: Option<Arc<dyn PreferenceStore>>) -> UserSyncCore {
        UserSyncCore::open(
            SyncConfig::default(),
            "app",
            prefs,
            Backends::from_shared(Arc::new(MockBackend::new())),
        )
        .unwrap()
    }

    fn names(core: &UserSyncCore) -> Vec<OperationName> {
        core.repository()
            .pending_operations()
            .iter()
            .map(Operation::name)
            .collect()
    }

    #[test]
    fn empty_app_id_is_refused() {
        let result = UserSyncCore::open(
            SyncConfig::default(),
            "",
            None,
            Backends::from_shared(Arc::new(MockBackend::new())),
        );
        assert!(matches!(result, Err(SyncError::MissingAppId)));
    }

    #[test]
    fn fresh_open_creates_anonymous_user() {
        let core = open(None);
        let id = core.onesignal_id().unwrap();
        assert!(is_local_id(&id));
        assert_eq!(core.external_id(), None);
        assert_eq!(names(&core), vec![OperationName::LoginUser]);
    }

    #[test]
    fn login_from_anonymous_identifies() {
        let core = open(None);
        let anonymous = core.onesignal_id().unwrap();
        core.login("alice").unwrap();

        let pending = core.repository().pending_operations();
        let OperationKind::LoginUser {
            external_id,
            existing_onesignal_id,
        } = &pending[1].kind
        else {
            panic!("expected a login");
        };
        assert_eq!(external_id.as_deref(), Some("alice"));
        assert_eq!(existing_onesignal_id.as_deref(), Some(anonymous.as_str()));
        assert_ne!(core.onesignal_id(), Some(anonymous));
        assert_eq!(core.external_id().as_deref(), Some("alice"));

        core.login("alice").unwrap();
        assert_eq!(core.repository().len(), 2);
    }

    #[test]
    fn switching_users_transfers_push() {
        let core = open(None);
        core.login("alice").unwrap();
        let push = core.set_push_subscription("token", true);
        core.add_subscription(SubscriptionType::Email, "a@x.io");
        core.logout().unwrap();

        assert_eq!(core.external_id(), None);
        let kept: Vec<_> = core
            .stores()
            .subscriptions
            .list()
            .iter()
            .filter_map(|s| s.id().map(str::to_string))
            .collect();
        assert_eq!(kept, vec![push.clone()]);
        let last = core.repository().pending_operations().pop().unwrap();
        assert!(matches!(
            &last.kind,
            OperationKind::TransferSubscription { subscription_id } if *subscription_id == push
        ));
        assert!(core.logout().is_ok());
    }

    #[test]
    fn reserved_aliases_are_refused() {
        let core = open(None);
        assert!(!core.add_alias("external_id", "x"));
        assert!(!core.remove_alias("onesignal_id"));
        assert!(core.add_alias("crm", "42"));
        assert!(names(&core).contains(&OperationName::SetAlias));
    }

    #[test]
    fn reopen_keeps_user_and_queue() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let first = open(Some(prefs.clone()));
        first.add_tag("level", "1");
        let id = first.onesignal_id();
        drop(first);

        let second = open(Some(prefs));
        assert_eq!(second.onesignal_id(), id);
        assert_eq!(
            names(&second),
            vec![OperationName::LoginUser, OperationName::SetTag]
        );
    }

    #[test]
    fn app_change_starts_a_new_user() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let first = open(Some(prefs.clone()));
        let id = first.onesignal_id();
        drop(first);

        let other = UserSyncCore::open(
            SyncConfig::default(),
            "other-app",
            Some(prefs),
            Backends::from_shared(Arc::new(MockBackend::new())),
        )
        .unwrap();
        assert_ne!(other.onesignal_id(), id);
    }

    #[test]
    fn sessions() {
        let core = open(None);
        let id = core.start_session();
        assert_eq!(core.stores().session.model().session_id(), Some(id.as_str()));
        assert!(core.stores().session.model().is_valid());
        core.end_session();
        assert!(!core.stores().session.model().is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn segmentation_wait_times_out_without_tokens() {
        let core = open(None);
        let token = core.wait_for_segmentation_ready(Duration::from_secs(1)).await;
        assert!(token.is_none());
    }
}
