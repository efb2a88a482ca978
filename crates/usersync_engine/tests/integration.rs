//! End-to-end tests: core, queue, executors and the in-memory backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use usersync_core::id::is_local_id;
use usersync_core::SubscriptionType;
use usersync_engine::{
    BackendCall, BackendError, Backends, MockBackend, Operation, OperationName, QueueEvent,
    RebuildService, RetryConfig, UserSyncCore,
};
use usersync_storage::PreferenceStore;
use usersync_testkit::{test_config, TempPreferences, TestHarness, TEST_APP_ID};

fn position(calls: &[BackendCall], name: &str) -> usize {
    calls
        .iter()
        .position(|c| c.name() == name)
        .unwrap_or_else(|| panic!("no {name} call in {calls:?}"))
}

fn open_with(backend: &Arc<MockBackend>, prefs: Arc<dyn PreferenceStore>) -> UserSyncCore {
    UserSyncCore::open(
        test_config(),
        TEST_APP_ID,
        Some(prefs),
        Backends::from_shared(Arc::clone(backend)),
    )
    .unwrap()
}

async fn drain(core: &UserSyncCore) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !core.repository().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("queue did not drain");
}

#[tokio::test]
async fn login_then_tags_reach_one_user() {
    let harness = TestHarness::started();
    harness.core.login("alice").unwrap();
    harness.core.add_tag("level", "3");
    harness.settle().await;

    assert_eq!(harness.backend.user_count(), 1);
    let onesignal_id = harness.core.onesignal_id().unwrap();
    assert!(!is_local_id(&onesignal_id));

    let user = harness.backend.user(&onesignal_id).unwrap();
    assert_eq!(user.identity.get("external_id").map(String::as_str), Some("alice"));
    assert_eq!(user.properties.tags.get("level").map(String::as_str), Some("3"));
    assert_eq!(harness.core.external_id().as_deref(), Some("alice"));
    harness.core.shutdown().await;
}

#[tokio::test]
async fn backend_never_sees_a_local_id() {
    let harness = TestHarness::started();
    harness.core.set_push_subscription("device-token", true);
    harness.core.add_tag("a", "1");
    harness.core.add_subscription(SubscriptionType::Email, "a@x.io");
    assert!(harness.core.add_alias("crm", "42"));
    harness.core.login("alice").unwrap();
    harness.core.add_tag("b", "2");
    harness.core.add_subscription(SubscriptionType::Sms, "+15550100");
    harness.settle().await;

    harness.core.logout().unwrap();
    harness.core.add_tag("c", "3");
    harness.settle().await;

    let calls = harness.backend.calls();
    assert!(!calls.is_empty());
    for call in &calls {
        for id in call.addressed_ids() {
            assert!(!is_local_id(id), "{call:?} addressed a local id");
        }
    }
    assert_eq!(harness.backend.call_count("transfer_subscription"), 1);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn edits_wait_for_the_user_to_exist() {
    let harness = TestHarness::new();
    harness.core.add_tag("level", "1");
    harness.core.set_language(Some("fr"));
    harness.core.start().unwrap();
    harness.settle().await;

    let calls = harness.backend.calls();
    assert!(position(&calls, "create_user") < position(&calls, "update_user"));
    // Both edits travel in one call.
    assert_eq!(harness.backend.call_count("update_user"), 1);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn push_subscription_rides_along_with_user_create() {
    let harness = TestHarness::new();
    let local = harness.core.set_push_subscription("device-token", true);
    harness.core.start().unwrap();
    harness.settle().await;

    assert!(matches!(
        harness.backend.calls().as_slice(),
        [BackendCall::CreateUser { subscriptions: 1, .. }]
    ));
    let push = harness.core.stores().push_subscription().unwrap();
    let promoted = push.id().unwrap();
    assert_ne!(promoted, local);
    assert!(!is_local_id(promoted));
    harness.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_batch_waits_out_retry_after() {
    let harness = TestHarness::with_config(
        test_config().with_retry(RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1))),
    );
    harness.core.start().unwrap();
    harness.settle().await;

    harness.backend.fail_next(
        "update_user",
        BackendError::status(429, None).with_retry_after(Duration::from_secs(10)),
    );
    let started = tokio::time::Instant::now();
    harness.core.add_tag("level", "3");
    harness.settle().await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(harness.backend.call_count("update_user"), 2);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn segmentation_ready_after_writes_land() {
    let harness = TestHarness::started();
    harness.settle().await;
    harness.core.add_tag("level", "3");
    harness.settle().await;

    let token = harness
        .core
        .wait_for_segmentation_ready(Duration::from_secs(5))
        .await;
    assert!(token.is_some());
    harness.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn segmentation_wait_gives_up_after_timeout() {
    // Not started: nothing ever lands.
    let harness = TestHarness::new();
    let token = harness
        .core
        .wait_for_segmentation_ready(Duration::from_millis(100))
        .await;
    assert!(token.is_none());
}

#[tokio::test]
async fn rebuild_is_repeatable_and_queues_nothing() {
    let harness = TestHarness::new();
    harness.core.set_push_subscription("device-token", true);
    let onesignal_id = harness.core.onesignal_id().unwrap();
    let pending = harness.core.repository().len();

    let rebuild = RebuildService::new(Arc::clone(harness.core.stores()));
    let first = rebuild.get_rebuild_operations(TEST_APP_ID, &onesignal_id).unwrap();
    let second = rebuild.get_rebuild_operations(TEST_APP_ID, &onesignal_id).unwrap();

    let names: Vec<_> = first.iter().map(|op| op.name()).collect();
    assert_eq!(
        names,
        vec![
            OperationName::LoginUser,
            OperationName::CreateSubscription,
            OperationName::RefreshUser,
        ]
    );
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert!(a.same_intent(b));
    }
    assert_eq!(harness.core.repository().len(), pending);
    assert!(rebuild.get_rebuild_operations(TEST_APP_ID, "someone-else").is_none());
}

#[tokio::test]
async fn lost_user_is_rebuilt() {
    let harness =
        TestHarness::with_config(test_config().with_missing_retry_window(Duration::ZERO));
    harness.core.login("alice").unwrap();
    harness.core.start().unwrap();
    harness.settle().await;
    let lost = harness.core.onesignal_id().unwrap();

    assert!(harness.backend.remove_user(&lost));
    harness.core.add_tag("level", "3");
    harness.settle().await;

    let rebuilt = harness.core.onesignal_id().unwrap();
    assert_ne!(rebuilt, lost);
    let user = harness.backend.user(&rebuilt).unwrap();
    assert_eq!(user.identity.get("external_id").map(String::as_str), Some("alice"));
    assert_eq!(harness.backend.call_count("get_user"), 1);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn rejected_login_drops_its_dependents() {
    let harness = TestHarness::new();
    harness
        .backend
        .fail_next("create_user", BackendError::status(400, Some("bad".into())));
    harness.core.add_tag("level", "3");
    let mut events = harness.core.repository().subscribe();
    harness.core.start().unwrap();

    loop {
        match events.recv().await {
            Some(QueueEvent::Failed {
                operations,
                dropped,
                ..
            }) => {
                assert_eq!(operations[0].name(), OperationName::LoginUser);
                assert_eq!(dropped.len(), 1);
                assert_eq!(dropped[0].name(), OperationName::SetTag);
                break;
            }
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    }
    harness.settle().await;
    assert_eq!(harness.backend.call_count("update_user"), 0);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn identified_login_reports_each_operation_once() {
    let harness = TestHarness::new();
    harness.core.login("bob").unwrap();
    harness.core.add_subscription(SubscriptionType::Email, "bob@x.io");
    let mut events = harness.core.repository().subscribe();
    harness.core.start().unwrap();
    harness.settle().await;

    let mut succeeded: HashMap<String, usize> = HashMap::new();
    let mut subscription_creates = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            QueueEvent::Succeeded { operations } => {
                for op in operations {
                    if op.name() == OperationName::CreateSubscription {
                        subscription_creates += 1;
                    }
                    *succeeded.entry(op.id).or_default() += 1;
                }
            }
            QueueEvent::Failed { operations, .. } => panic!("unexpected failure of {operations:?}"),
            _ => {}
        }
    }
    assert!(succeeded.values().all(|count| *count == 1), "{succeeded:?}");
    assert_eq!(subscription_creates, 1);
    assert_eq!(harness.backend.call_count("set_aliases"), 1);
    assert_eq!(harness.backend.call_count("create_subscription"), 1);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn rejected_subscription_does_not_stall_the_queue() {
    let harness = TestHarness::started();
    harness.settle().await;

    harness
        .backend
        .fail_next("create_subscription", BackendError::status(400, Some("bad".into())));
    let id = harness.core.add_subscription(SubscriptionType::Email, "a@x.io");
    assert!(harness.core.remove_subscription(&id));
    harness.core.add_tag("level", "3");
    harness.settle().await;

    assert!(harness.core.repository().is_empty());
    assert_eq!(harness.backend.call_count("delete_subscription"), 0);
    assert_eq!(harness.backend.call_count("update_user"), 1);
    harness.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn users_drain_concurrently_but_each_in_order() {
    let harness = TestHarness::started();
    harness.settle().await;

    let users = [
        harness.backend.insert_user(BTreeMap::new()),
        harness.backend.insert_user(BTreeMap::new()),
    ];
    harness.backend.set_latency(Duration::from_millis(100));
    let started = tokio::time::Instant::now();
    for user in &users {
        // Different records, so two batches per user.
        let repository = harness.core.repository();
        repository.enqueue(Operation::set_tag(TEST_APP_ID, user, "level", "3"), false);
        repository.enqueue(Operation::set_alias(TEST_APP_ID, user, "crm", "42"), true);
    }
    harness.settle().await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    assert_eq!(harness.backend.peak_concurrency(), 2);
    for user in &users {
        assert_eq!(harness.backend.peak_concurrency_for(user), 1);
        let stored = harness.backend.user(user).unwrap();
        assert_eq!(stored.properties.tags.get("level").map(String::as_str), Some("3"));
        assert_eq!(stored.identity.get("crm").map(String::as_str), Some("42"));
    }
    let calls = harness.backend.calls();
    for user in &users {
        let of_user: Vec<_> = calls
            .iter()
            .filter(|c| c.addressed_ids().contains(&user.as_str()))
            .map(BackendCall::name)
            .collect();
        assert_eq!(of_user, vec!["update_user", "set_aliases"]);
    }
    harness.core.shutdown().await;
}

#[tokio::test]
async fn queue_survives_restart() {
    let harness = TestHarness::new();
    harness.core.add_tag("level", "3");
    let local = harness.core.onesignal_id().unwrap();

    let harness = harness.restart().await;
    harness.settle().await;

    assert_eq!(harness.backend.call_count("create_user"), 1);
    assert_eq!(harness.backend.call_count("update_user"), 1);
    assert_ne!(harness.core.onesignal_id().unwrap(), local);
    harness.core.shutdown().await;
}

#[tokio::test]
async fn file_preferences_resume_the_same_user() {
    let temp = TempPreferences::new();
    let backend = Arc::new(MockBackend::new());

    let local = {
        let core = open_with(&backend, temp.open());
        core.add_tag("level", "3");
        core.onesignal_id().unwrap()
    };

    let core = open_with(&backend, temp.open());
    assert_eq!(core.onesignal_id().as_deref(), Some(local.as_str()));
    assert_eq!(core.repository().len(), 2);

    core.start().unwrap();
    drain(&core).await;

    assert_eq!(backend.user_count(), 1);
    let onesignal_id = core.onesignal_id().unwrap();
    let user = backend.user(&onesignal_id).unwrap();
    assert_eq!(user.properties.tags.get("level").map(String::as_str), Some("3"));
    core.shutdown().await;
}
