//! User-domain models.
//!
//! Each model is a typed view over a [`Model`](crate::Model) property bag.
//! Property names are part of the persisted format and the operation
//! mapping, so they live here as constants.

mod config;
mod identity;
mod properties;
mod session;
mod subscription;

pub use config::ConfigModel;
pub use identity::IdentityModel;
pub use properties::PropertiesModel;
pub use session::SessionModel;
pub use subscription::{SubscriptionModel, SubscriptionType};

/// Name of the singleton config store.
pub const CONFIG_STORE: &str = "config";
/// Name of the singleton identity store.
pub const IDENTITY_STORE: &str = "identity";
/// Name of the singleton properties store.
pub const PROPERTIES_STORE: &str = "properties";
/// Name of the singleton session store.
pub const SESSION_STORE: &str = "session";
/// Name of the keyed subscriptions store.
pub const SUBSCRIPTIONS_STORE: &str = "subscriptions";

macro_rules! store_model {
    ($name:ident) => {
        impl $crate::model::StoreModel for $name {
            fn from_model(model: $crate::model::Model) -> Self {
                Self(model)
            }

            fn model(&self) -> &$crate::model::Model {
                &self.0
            }

            fn model_mut(&mut self) -> &mut $crate::model::Model {
                &mut self.0
            }
        }
    };
}

pub(crate) use store_model;
