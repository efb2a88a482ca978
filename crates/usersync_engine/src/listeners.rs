//! Store listeners.
//!
//! Listeners turn application edits of the user stores into queued
//! operations. Only [`ModelChangeTag::Normal`] changes are forwarded:
//! hydration from backend responses and internal bookkeeping never echo
//! back to the backend.
//!
//! Stores own their handlers, so listeners reach the repository and stores
//! through weak references.

use crate::operation::{Operation, SubscriptionFields};
use crate::repository::OperationRepository;
use crate::stores::UserStores;
use std::sync::{Arc, Weak};
use usersync_core::{
    IdentityModel, ModelChangeTag, ModelChangedArgs, ModelStoreChangeHandler, PropertiesModel,
    PropertyValue, SingletonModelStoreChangeHandler, SubscriptionModel,
};

#[derive(Clone)]
struct OperationSink {
    repository: Weak<OperationRepository>,
    stores: Weak<UserStores>,
}

impl OperationSink {
    fn app_id(&self) -> Option<String> {
        let app_id = self.stores.upgrade()?.app_id();
        if app_id.is_none() {
            tracing::warn!("dropping a change made before an app id was configured");
        }
        app_id
    }

    fn current_onesignal_id(&self) -> Option<String> {
        self.stores.upgrade()?.current_onesignal_id()
    }

    fn enqueue(&self, operation: Operation) {
        match self.repository.upgrade() {
            Some(repository) => repository.enqueue(operation, false),
            None => tracing::debug!(op = %operation, "repository gone; change not queued"),
        }
    }
}

/// Forwards alias edits.
pub struct IdentityListener {
    sink: OperationSink,
}

impl SingletonModelStoreChangeHandler<IdentityModel> for IdentityListener {
    fn on_model_replaced(&self, _model: &IdentityModel, _tag: ModelChangeTag) {}

    fn on_model_updated(&self, args: &ModelChangedArgs<IdentityModel>, tag: ModelChangeTag) {
        if !tag.propagates() || args.property == IdentityModel::ONESIGNAL_ID {
            return;
        }
        let (Some(app_id), Some(onesignal_id)) = (self.sink.app_id(), args.model.onesignal_id()) else {
            return;
        };
        let operation = match &args.new_value {
            PropertyValue::String(value) => {
                Operation::set_alias(&app_id, onesignal_id, &args.property, value)
            }
            PropertyValue::Null => Operation::delete_alias(&app_id, onesignal_id, &args.property),
            other => {
                tracing::warn!(label = %args.property, kind = other.type_name(), "ignoring non-string alias");
                return;
            }
        };
        self.sink.enqueue(operation);
    }
}

/// Forwards tag and property edits.
pub struct PropertiesListener {
    sink: OperationSink,
}

impl SingletonModelStoreChangeHandler<PropertiesModel> for PropertiesListener {
    fn on_model_replaced(&self, _model: &PropertiesModel, _tag: ModelChangeTag) {}

    fn on_model_updated(&self, args: &ModelChangedArgs<PropertiesModel>, tag: ModelChangeTag) {
        if !tag.propagates() || args.property == PropertiesModel::ONESIGNAL_ID {
            return;
        }
        let (Some(app_id), Some(onesignal_id)) = (self.sink.app_id(), args.model.onesignal_id()) else {
            return;
        };

        let tag_key = args
            .path
            .strip_prefix(PropertiesModel::TAGS)
            .and_then(|rest| rest.strip_prefix('.'));
        let operation = match tag_key {
            Some(key) => match args.new_value.as_str() {
                Some(value) => Operation::set_tag(&app_id, onesignal_id, key, value),
                None => Operation::delete_tag(&app_id, onesignal_id, key),
            },
            None => Operation::set_property(
                &app_id,
                onesignal_id,
                &args.property,
                args.new_value.clone(),
            ),
        };
        self.sink.enqueue(operation);
    }
}

/// Forwards subscription additions, edits and removals.
pub struct SubscriptionListener {
    sink: OperationSink,
}

impl SubscriptionListener {
    fn target(&self) -> Option<(String, String)> {
        Some((self.sink.app_id()?, self.sink.current_onesignal_id()?))
    }
}

impl ModelStoreChangeHandler<SubscriptionModel> for SubscriptionListener {
    fn on_model_added(&self, model: &SubscriptionModel, tag: ModelChangeTag) {
        if !tag.propagates() {
            return;
        }
        let (Some((app_id, onesignal_id)), Some(fields)) = (self.target(), SubscriptionFields::from_model(model))
        else {
            return;
        };
        self.sink
            .enqueue(Operation::create_subscription(&app_id, &onesignal_id, fields));
    }

    fn on_model_updated(&self, args: &ModelChangedArgs<SubscriptionModel>, tag: ModelChangeTag) {
        if !tag.propagates() {
            return;
        }
        let (Some((app_id, onesignal_id)), Some(fields)) =
            (self.target(), SubscriptionFields::from_model(&args.model))
        else {
            return;
        };
        self.sink
            .enqueue(Operation::update_subscription(&app_id, &onesignal_id, fields));
    }

    fn on_model_removed(&self, model: &SubscriptionModel, tag: ModelChangeTag) {
        if !tag.propagates() {
            return;
        }
        let (Some((app_id, onesignal_id)), Some(id)) = (self.target(), model.id()) else {
            return;
        };
        self.sink
            .enqueue(Operation::delete_subscription(&app_id, &onesignal_id, id));
    }
}

/// Subscribes every listener to `stores`.
pub fn subscribe_listeners(stores: &Arc<UserStores>, repository: &Arc<OperationRepository>) {
    let sink = OperationSink {
        repository: Arc::downgrade(repository),
        stores: Arc::downgrade(stores),
    };
    stores
        .identity
        .subscribe(Arc::new(IdentityListener { sink: sink.clone() }));
    stores
        .properties
        .subscribe(Arc::new(PropertiesListener { sink: sink.clone() }));
    stores
        .subscriptions
        .subscribe(Arc::new(SubscriptionListener { sink }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::new_records::NewRecordsState;
    use crate::operation::{OperationKind, OperationName};
    use std::time::Duration;
    use usersync_core::SubscriptionType;

    fn setup() -> (Arc<UserStores>, Arc<OperationRepository>) {
        let stores = Arc::new(UserStores::in_memory());
        stores
            .config
            .update(ModelChangeTag::NoPropagate, |c| c.set_app_id("app"));
        stores.identity.replace(
            IdentityModel::with_onesignal_id("user-1"),
            ModelChangeTag::NoPropagate,
        );
        stores.properties.replace(
            PropertiesModel::with_onesignal_id("user-1"),
            ModelChangeTag::NoPropagate,
        );
        let repository = OperationRepository::new(
            SyncConfig::default(),
            Vec::new(),
            Arc::new(NewRecordsState::new(Duration::ZERO, Duration::ZERO)),
            None,
        );
        subscribe_listeners(&stores, &repository);
        (stores, repository)
    }

    fn names(repository: &OperationRepository) -> Vec<OperationName> {
        repository.pending_operations().iter().map(Operation::name).collect()
    }

    #[test]
    fn alias_edits_become_operations() {
        let (stores, repository) = setup();
        stores
            .identity
            .update(ModelChangeTag::Normal, |m| m.set_alias("crm", Some("42")));
        stores
            .identity
            .update(ModelChangeTag::Normal, |m| m.set_alias("facebook", Some("f")));
        stores
            .identity
            .update(ModelChangeTag::Normal, |m| m.set_alias("facebook", None));
        assert_eq!(
            names(&repository),
            vec![OperationName::SetAlias, OperationName::DeleteAlias]
        );
    }

    #[test]
    fn tags_and_properties_are_split() {
        let (stores, repository) = setup();
        stores.properties.update(ModelChangeTag::Normal, |m| {
            m.set_tag("level", Some("3"));
            m.set_language(Some("fr"));
        });
        stores
            .properties
            .update(ModelChangeTag::Normal, |m| m.set_tag("level", None));

        let pending = repository.pending_operations();
        assert_eq!(pending.len(), 2);
        assert!(matches!(&pending[0].kind, OperationKind::SetProperty { property, .. } if property == "language"));
        assert!(matches!(&pending[1].kind, OperationKind::DeleteTag { key } if key == "level"));
    }

    #[test]
    fn hydration_is_not_echoed() {
        let (stores, repository) = setup();
        stores
            .properties
            .update(ModelChangeTag::Hydrate, |m| m.set_tag("level", Some("3")));
        stores
            .identity
            .update(ModelChangeTag::NoPropagate, |m| m.set_alias("crm", Some("1")));
        assert!(repository.is_empty());
    }

    #[test]
    fn subscription_lifecycle() {
        let (stores, repository) = setup();
        stores.subscriptions.add(
            SubscriptionModel::new("local-s", SubscriptionType::Email, "a@x.io", true, 1),
            ModelChangeTag::Normal,
        );
        stores
            .subscriptions
            .update("local-s", ModelChangeTag::Normal, |m| m.set_address("b@x.io"));
        stores.subscriptions.remove("local-s", ModelChangeTag::Normal);
        assert_eq!(
            names(&repository),
            vec![
                OperationName::CreateSubscription,
                OperationName::UpdateSubscription,
                OperationName::DeleteSubscription,
            ]
        );
    }

    #[test]
    fn changes_without_app_id_are_dropped() {
        let (stores, repository) = setup();
        stores.config.replace(Default::default(), ModelChangeTag::NoPropagate);
        stores
            .properties
            .update(ModelChangeTag::Normal, |m| m.set_tag("k", Some("v")));
        assert!(repository.is_empty());
    }
}
