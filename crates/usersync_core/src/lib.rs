//! # usersync core
//!
//! Local, authoritative user state for the usersync client.
//!
//! This crate provides:
//! - [`Model`]: a named bag of typed properties that records its own changes
//! - [`ModelStore`] / [`SingletonModelStore`]: persisted, observable
//!   collections of models
//! - The user-domain models (identity, properties, subscriptions, config,
//!   session)
//! - Local placeholder ids ([`id`])
//! - [`ConsistencyManager`]: read-your-write tokens and the conditions that
//!   wait on them
//!
//! ## Change tags
//!
//! Every mutation carries a [`ModelChangeTag`]. Only [`ModelChangeTag::Normal`]
//! changes originate from application code; listeners turn those into
//! outgoing operations. [`ModelChangeTag::Hydrate`] marks state copied in
//! from a backend response and must never be sent back.
//!
//! ## Key Invariants
//!
//! - Property reads never fail
//! - Every store mutation is persisted before the call returns
//! - Subscribers are notified synchronously with the mutation
//! - Token updates and condition sweeps share one critical section

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod consistency;
mod error;
pub mod id;
mod model;
mod models;
mod singleton;
mod store;
mod value;

pub use consistency::{
    wait_with_timeout, AllOf, AnyOf, Condition, ConditionFuture, ConsistencyManager, EntityTokens,
    EntityCondition, RywToken, SegmentationReadyCondition, TokenKind, TokenMap, TokenPredicate,
    TokenPresent,
};
pub use error::{CoreError, CoreResult};
pub use model::{Model, ModelChangeTag, PropertyChange, StoreModel};
pub use models::{
    ConfigModel, IdentityModel, PropertiesModel, SessionModel, SubscriptionModel,
    SubscriptionType, CONFIG_STORE, IDENTITY_STORE, PROPERTIES_STORE, SESSION_STORE,
    SUBSCRIPTIONS_STORE,
};
pub use singleton::{SingletonModelStore, SingletonModelStoreChangeHandler};
pub use store::{HandlerId, ModelChangedArgs, ModelStore, ModelStoreChangeHandler};
pub use value::PropertyValue;
