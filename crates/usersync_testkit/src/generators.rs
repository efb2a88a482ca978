//! Property-based test generators using proptest.
//!
//! Strategies produce operations over a small pool of users and ids so
//! that generated queues exercise coalescing and id promotion.

use proptest::prelude::*;
use std::collections::BTreeMap;
use usersync_core::id::LOCAL_PREFIX;
use usersync_core::{PropertyValue, SubscriptionType};
use usersync_engine::{Operation, SubscriptionFields};

/// App id every generated operation uses.
pub const GENERATED_APP_ID: &str = "gen-app";

/// Strategy for scalar property values.
pub fn scalar_value_strategy() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        Just(PropertyValue::Null),
        any::<bool>().prop_map(PropertyValue::Bool),
        any::<i64>().prop_map(PropertyValue::Int),
        (-1.0e6f64..1.0e6).prop_map(PropertyValue::Float),
        "[a-zA-Z0-9 ]{0,16}".prop_map(PropertyValue::String),
    ]
}

/// Strategy for property values, nesting maps up to two levels deep.
pub fn property_value_strategy() -> impl Strategy<Value = PropertyValue> {
    scalar_value_strategy().prop_recursive(2, 16, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(PropertyValue::Map)
    })
}

/// Strategy for tag keys drawn from a small pool, so collisions are common.
pub fn tag_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["level", "plan", "color", "score"]).prop_map(str::to_string)
}

/// Strategy for user ids: a mix of local and backend ids.
pub fn user_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        format!("{LOCAL_PREFIX}user-a"),
        format!("{LOCAL_PREFIX}user-b"),
        "user-1".to_string(),
        "user-2".to_string(),
    ])
}

/// Strategy for subscription ids: a mix of local and backend ids.
pub fn subscription_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        format!("{LOCAL_PREFIX}sub-a"),
        "sub-1".to_string(),
        "sub-2".to_string(),
    ])
}

fn fields_strategy() -> impl Strategy<Value = SubscriptionFields> {
    (subscription_id_strategy(), "[a-z]{1,8}@x\\.io", any::<bool>()).prop_map(
        |(subscription_id, address, opted_in)| SubscriptionFields {
            subscription_id,
            subscription_type: SubscriptionType::Email,
            address,
            opted_in,
            status: if opted_in { 1 } else { -2 },
        },
    )
}

/// Strategy for non-login operations.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    let app = GENERATED_APP_ID;
    prop_oneof![
        (user_id_strategy(), tag_key_strategy(), "[a-z0-9]{1,6}")
            .prop_map(move |(user, key, value)| Operation::set_tag(app, &user, &key, &value)),
        (user_id_strategy(), tag_key_strategy())
            .prop_map(move |(user, key)| Operation::delete_tag(app, &user, &key)),
        (user_id_strategy(), prop::sample::select(vec!["crm", "facebook"]), "[a-z0-9]{1,6}")
            .prop_map(move |(user, label, value)| Operation::set_alias(app, &user, label, &value)),
        (user_id_strategy(), property_value_strategy())
            .prop_map(move |(user, value)| Operation::set_property(app, &user, "language", value)),
        (user_id_strategy(), fields_strategy())
            .prop_map(move |(user, fields)| Operation::create_subscription(app, &user, fields)),
        (user_id_strategy(), fields_strategy())
            .prop_map(move |(user, fields)| Operation::update_subscription(app, &user, fields)),
        (user_id_strategy(), subscription_id_strategy())
            .prop_map(move |(user, id)| Operation::delete_subscription(app, &user, &id)),
        user_id_strategy().prop_map(move |user| Operation::refresh_user(app, &user)),
    ]
}

/// Strategy for promotions of every local id the generators produce.
pub fn translations_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    ("[a-f0-9]{8}", "[a-f0-9]{8}").prop_map(|(user, sub)| {
        let mut map = BTreeMap::new();
        map.insert(format!("{LOCAL_PREFIX}user-a"), format!("user-{user}"));
        map.insert(format!("{LOCAL_PREFIX}user-b"), format!("user-{user}-b"));
        map.insert(format!("{LOCAL_PREFIX}sub-a"), format!("sub-{sub}"));
        map
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use usersync_core::id::is_local_id;
    use usersync_engine::{NewRecordsState, OperationName, OperationRepository, SyncConfig};

    fn repository() -> Arc<OperationRepository> {
        OperationRepository::new(
            SyncConfig::default(),
            Vec::new(),
            Arc::new(NewRecordsState::new(Duration::ZERO, Duration::ZERO)),
            None,
        )
    }

    proptest! {
        #[test]
        fn coalescing_leaves_one_pending_op_per_key(
            ops in prop::collection::vec(operation_strategy(), 1..40)
        ) {
            let repository = repository();
            for op in &ops {
                repository.enqueue(op.clone(), false);
            }

            let pending = repository.pending_operations();
            let mut seen = HashSet::new();
            for op in &pending {
                if let Some(key) = op.coalesce_key() {
                    prop_assert!(seen.insert(key), "duplicate coalesce key for {}", op);
                }
            }

            // The newest edit of each key is the one kept.
            for op in &ops {
                let Some(key) = op.coalesce_key() else { continue };
                let newest = ops.iter().rev().find(|o| o.coalesce_key().as_ref() == Some(&key));
                let kept = pending.iter().find(|o| o.coalesce_key().as_ref() == Some(&key));
                prop_assert_eq!(kept.map(|o| &o.id), newest.map(|o| &o.id));
            }
        }

        #[test]
        fn translation_removes_every_mapped_local_id(
            mut op in operation_strategy(),
            translations in translations_strategy()
        ) {
            let before = op.clone();
            let changed = op.translate_ids(&translations);

            prop_assert!(!is_local_id(&op.onesignal_id));
            if let Some(id) = op.subscription_id() {
                prop_assert!(!is_local_id(id));
            }
            prop_assert_eq!(changed, op != before);
            prop_assert_eq!(op.name(), before.name());
            prop_assert_eq!(&op.id, &before.id);

            // A second pass has nothing left to rewrite.
            prop_assert!(!op.translate_ids(&translations));
        }

        #[test]
        fn executable_ops_hold_no_local_ids(op in operation_strategy()) {
            if op.can_start_execute() {
                prop_assert!(!is_local_id(&op.onesignal_id));
                if let Some(id) = op.subscription_id() {
                    prop_assert!(!is_local_id(id) || op.name() == OperationName::CreateSubscription);
                }
            }
        }
    }
}
