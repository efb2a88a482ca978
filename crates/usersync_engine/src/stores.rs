//! The user-domain model stores.

use std::sync::Arc;
use usersync_core::{
    ConfigModel, IdentityModel, ModelStore, PropertiesModel, SessionModel, SingletonModelStore,
    SubscriptionModel, CONFIG_STORE, IDENTITY_STORE, PROPERTIES_STORE, SESSION_STORE,
    SUBSCRIPTIONS_STORE,
};
use usersync_storage::PreferenceStore;

/// Every store describing the current user.
///
/// Built once by the composition root and shared by reference; nothing
/// else constructs stores.
pub struct UserStores {
    /// App configuration.
    pub config: Arc<SingletonModelStore<ConfigModel>>,
    /// Current user's ids and aliases.
    pub identity: Arc<SingletonModelStore<IdentityModel>>,
    /// Current user's properties.
    pub properties: Arc<SingletonModelStore<PropertiesModel>>,
    /// Current user's subscriptions.
    pub subscriptions: Arc<ModelStore<SubscriptionModel>>,
    /// Current session.
    pub session: Arc<SingletonModelStore<SessionModel>>,
}

impl UserStores {
    /// Opens every store, loading persisted models from `prefs`.
    pub fn open(prefs: Option<Arc<dyn PreferenceStore>>) -> Self {
        Self {
            config: Arc::new(SingletonModelStore::new(CONFIG_STORE, prefs.clone())),
            identity: Arc::new(SingletonModelStore::new(IDENTITY_STORE, prefs.clone())),
            properties: Arc::new(SingletonModelStore::new(PROPERTIES_STORE, prefs.clone())),
            subscriptions: Arc::new(ModelStore::new(SUBSCRIPTIONS_STORE, prefs.clone())),
            session: Arc::new(SingletonModelStore::new(SESSION_STORE, prefs)),
        }
    }

    /// Opens every store without persistence.
    pub fn in_memory() -> Self {
        Self::open(None)
    }

    /// Returns the configured app id.
    pub fn app_id(&self) -> Option<String> {
        self.config.model().app_id().map(str::to_string)
    }

    /// Returns the current user's id.
    pub fn current_onesignal_id(&self) -> Option<String> {
        self.identity.model().onesignal_id().map(str::to_string)
    }

    /// Returns true if `onesignal_id` is the current user.
    pub fn is_current_user(&self, onesignal_id: &str) -> bool {
        self.identity.model().onesignal_id() == Some(onesignal_id)
    }

    /// Returns the device's push subscription, if configured.
    pub fn push_subscription(&self) -> Option<SubscriptionModel> {
        let config = self.config.model();
        self.subscriptions.get(config.push_subscription_id()?)
    }
}
