//! The durable operation queue.
//!
//! Operations are appended by the listeners and drained by one worker task.
//! A drain pass walks the queue front to back and picks, for every group
//! (an app and user pair) without a batch in flight, the first operation.
//! If it can run, it starts a batch together with the later operations of
//! the same group that share its comparison key; a login also takes the
//! subscription creates still waiting on the user it creates. Batches of
//! different groups run concurrently; one group never has two batches in
//! flight.
//!
//! A batch that fails terminally abandons the local ids it would have
//! promoted. Queued operations referencing them are dropped with it, and
//! later operations waiting on them are refused.
//!
//! # Persistence
//!
//! After every mutation the queue (in-flight batches first) is written to
//! the `operations` preference key, and the id translations learned so far
//! to `id_translations`. On open both are read back and the translations
//! reapplied, so operations persisted with a local id resume after the id
//! was promoted; those waiting on an id nothing queued will promote are
//! discarded. A failed write is logged and the in-memory queue stays
//! authoritative.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::executor::{ExecutionResponse, ExecutionResult, OperationExecutor, OperationFailure};
use crate::new_records::NewRecordsState;
use crate::operation::{GroupComparisonType, Operation, OperationName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use usersync_storage::{keys, PreferenceStore};

const NEVER_PROMOTED: &str = "depends on an id that will never be promoted";

/// Something that happened to queued operations.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A batch was applied.
    Succeeded {
        /// The batch, in queue order.
        operations: Vec<Operation>,
    },
    /// Local ids were promoted to backend ids.
    Translated {
        /// Local id to backend id.
        translations: BTreeMap<String, String>,
    },
    /// A batch went back to the queue.
    Retrying {
        /// The batch, in queue order.
        operations: Vec<Operation>,
        /// Attempt number of the next try.
        attempt: u32,
        /// Delay before the next try.
        delay: Duration,
    },
    /// A batch was dropped.
    Failed {
        /// The batch, in queue order.
        operations: Vec<Operation>,
        /// Why.
        failure: OperationFailure,
        /// Queued operations dropped with it because they depended on it.
        dropped: Vec<Operation>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedOperation {
    operation: Operation,
    #[serde(default)]
    retries: u32,
}

struct QueueItem {
    operation: Operation,
    retries: u32,
    not_before: Option<Instant>,
    waiters: Vec<oneshot::Sender<bool>>,
}

impl QueueItem {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            retries: 0,
            not_before: None,
            waiters: Vec::new(),
        }
    }

    fn resolve(self, applied: bool) -> Operation {
        for waiter in self.waiters {
            // The waiter may have given up.
            let _ = waiter.send(applied);
        }
        self.operation
    }

    fn persisted(&self) -> PersistedOperation {
        PersistedOperation {
            operation: self.operation.clone(),
            retries: self.retries,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueueItem>,
    /// Batches being executed, by group.
    in_flight: HashMap<String, Vec<QueueItem>>,
    translations: BTreeMap<String, String>,
    /// Local ids that will never be promoted.
    abandoned: HashSet<String>,
    /// Debounce: nothing starts before this instant.
    hold_until: Option<Instant>,
    stopping: bool,
}

enum Readiness {
    Ready,
    Wait(Instant),
    Blocked,
}

struct Batch {
    group: String,
    executor: Arc<dyn OperationExecutor>,
    operations: Vec<Operation>,
}

/// The operation queue and its worker.
pub struct OperationRepository {
    config: SyncConfig,
    state: Mutex<QueueState>,
    wake: Notify,
    executors: HashMap<OperationName, Arc<dyn OperationExecutor>>,
    new_records: Arc<NewRecordsState>,
    prefs: Option<Arc<dyn PreferenceStore>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OperationRepository {
    /// Creates a repository, loading any persisted queue from `prefs`.
    ///
    /// The worker is not running until [`OperationRepository::start`].
    pub fn new(
        config: SyncConfig,
        executors: Vec<Arc<dyn OperationExecutor>>,
        new_records: Arc<NewRecordsState>,
        prefs: Option<Arc<dyn PreferenceStore>>,
    ) -> Arc<Self> {
        let mut by_name = HashMap::new();
        for executor in executors {
            for name in executor.operations() {
                by_name.insert(*name, Arc::clone(&executor));
            }
        }

        let state = match prefs.as_deref() {
            Some(prefs) => load_state(prefs),
            None => QueueState::default(),
        };
        if !state.queue.is_empty() {
            tracing::info!(count = state.queue.len(), "resuming persisted operations");
        }

        Arc::new(Self {
            config,
            state: Mutex::new(state),
            wake: Notify::new(),
            executors: by_name,
            new_records,
            prefs,
            observers: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the worker on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> SyncResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SyncError::AlreadyStarted);
        }
        self.state.lock().stopping = false;
        *worker = Some(runtime.spawn(Arc::clone(self).run()));
        tracing::debug!("operation repository started");
        Ok(())
    }

    /// Stops the worker after the batches in flight complete.
    pub async fn shutdown(&self) {
        self.state.lock().stopping = true;
        self.wake.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "operation worker panicked");
            }
        }
        let state = self.state.lock();
        self.persist_queue(&state);
        tracing::debug!(pending = state.queue.len(), "operation repository stopped");
    }

    /// Appends an operation.
    ///
    /// Known local ids are rewritten first. A queued operation with the
    /// same coalesce key is replaced; the new one goes to the tail. Without
    /// `flush` the worker waits out the execution interval so more edits
    /// can join the batch.
    pub fn enqueue(&self, operation: Operation, flush: bool) {
        self.push(operation, flush, None);
    }

    /// Appends an operation and waits until it is applied (`true`) or
    /// dropped (`false`).
    pub async fn enqueue_and_wait(&self, operation: Operation, flush: bool) -> bool {
        let (tx, rx) = oneshot::channel();
        self.push(operation, flush, Some(tx));
        rx.await.unwrap_or(false)
    }

    /// Starts a drain pass now, skipping the execution interval.
    pub fn flush(&self) {
        self.state.lock().hold_until = None;
        self.wake.notify_one();
    }

    /// Returns queued and in-flight operations, in-flight first.
    pub fn pending_operations(&self) -> Vec<Operation> {
        let state = self.state.lock();
        state
            .in_flight
            .values()
            .flatten()
            .chain(state.queue.iter())
            .map(|item| item.operation.clone())
            .collect()
    }

    /// Returns true if any queued or in-flight operation matches.
    pub fn any_pending<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Operation) -> bool,
    {
        let state = self.state.lock();
        state
            .in_flight
            .values()
            .flatten()
            .chain(state.queue.iter())
            .any(|item| predicate(&item.operation))
    }

    /// Returns the number of queued and in-flight operations.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + state.in_flight.values().map(Vec::len).sum::<usize>()
    }

    /// Returns true if nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every id translation learned so far.
    pub fn translations(&self) -> BTreeMap<String, String> {
        self.state.lock().translations.clone()
    }

    /// Returns a stream of queue events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().push(tx);
        rx
    }

    fn push(&self, mut operation: Operation, flush: bool, waiter: Option<oneshot::Sender<bool>>) {
        {
            let mut state = self.state.lock();
            operation.translate_ids(&state.translations);
            let mut item = QueueItem::new(operation);
            item.waiters.extend(waiter);

            if item
                .operation
                .awaits()
                .iter()
                .any(|id| state.abandoned.contains(*id))
            {
                drop(state);
                tracing::warn!(op = %item.operation, "refusing operation on an id that will never be promoted");
                let operation = item.resolve(false);
                self.emit(vec![QueueEvent::Failed {
                    operations: vec![operation],
                    failure: OperationFailure::new(NEVER_PROMOTED),
                    dropped: Vec::new(),
                }]);
                return;
            }

            if let Some(key) = item.operation.coalesce_key() {
                let position = state
                    .queue
                    .iter()
                    .position(|queued| queued.operation.coalesce_key().as_deref() == Some(key.as_str()));
                if let Some(replaced) = position.and_then(|i| state.queue.remove(i)) {
                    tracing::debug!(op = %replaced.operation, "coalesced queued operation");
                    item.waiters.extend(replaced.waiters);
                    item.not_before = replaced.not_before;
                }
            }

            tracing::trace!(op = %item.operation, flush, "enqueued");
            state.queue.push_back(item);
            if flush {
                state.hold_until = None;
            } else if state.hold_until.is_none() && !self.config.execution_interval.is_zero() {
                state.hold_until = Some(Instant::now() + self.config.execution_interval);
            }
            self.persist_queue(&state);
        }
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        let mut running = JoinSet::new();
        loop {
            let (batches, wake_at) = {
                let mut state = self.state.lock();
                if state.stopping {
                    break;
                }
                self.new_records.prune();
                self.select_batches(&mut state)
            };

            for batch in batches {
                running.spawn(Arc::clone(&self).execute(batch));
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = sleep_until(wake_at) => {}
            }
        }
        while running.join_next().await.is_some() {}
    }

    async fn execute(self: Arc<Self>, batch: Batch) {
        tracing::debug!(
            group = %batch.group,
            op = %batch.operations[0],
            size = batch.operations.len(),
            "executing batch"
        );
        let call = batch.executor.execute(batch.operations.clone());
        let response = match tokio::time::timeout(self.config.backend_timeout, call).await {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(group = %batch.group, "batch timed out");
                ExecutionResponse::retry(None)
            }
        };
        self.complete(&batch.group, response);
    }

    fn readiness(&self, item: &QueueItem, now: Instant) -> Readiness {
        if let Some(not_before) = item.not_before {
            if not_before > now {
                return Readiness::Wait(not_before);
            }
        }
        let operation = &item.operation;
        if !operation.can_start_execute() {
            return Readiness::Blocked;
        }
        if !operation.creates_user() {
            let ids = std::iter::once(operation.onesignal_id.as_str()).chain(operation.subscription_id());
            if let Some(at) = ids.filter_map(|id| self.new_records.accessible_at(id)).max() {
                return Readiness::Wait(at);
            }
        }
        Readiness::Ready
    }

    fn select_batches(&self, state: &mut QueueState) -> (Vec<Batch>, Option<Instant>) {
        let now = Instant::now();
        if let Some(hold) = state.hold_until {
            if hold > now {
                return (Vec::new(), Some(hold));
            }
            state.hold_until = None;
        }

        let mut batches = Vec::new();
        let mut wake_at: Option<Instant> = None;
        let mut decided: HashSet<String> = state.in_flight.keys().cloned().collect();
        let mut index = 0;

        while index < state.queue.len() {
            let group = state.queue[index].operation.group_key();
            if decided.contains(&group) {
                index += 1;
                continue;
            }
            match self.readiness(&state.queue[index], now) {
                Readiness::Ready => {}
                Readiness::Wait(at) => {
                    // Backoff holds the whole group to keep its order.
                    decided.insert(group);
                    wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
                    index += 1;
                    continue;
                }
                // Waits for an id promotion; later operations of the group
                // (the one doing the promotion included) may go ahead.
                Readiness::Blocked => {
                    index += 1;
                    continue;
                }
            }
            decided.insert(group.clone());

            let members = self.batch_members(state, index, &group, now);
            let mut items: Vec<QueueItem> = Vec::with_capacity(members.len());
            for &member in members.iter().rev() {
                if let Some(item) = state.queue.remove(member) {
                    items.push(item);
                }
            }
            items.reverse();

            let name = items[0].operation.name();
            let Some(executor) = self.executors.get(&name).cloned() else {
                tracing::error!(operation = %name, "no executor registered; dropping batch");
                for item in items {
                    item.resolve(false);
                }
                continue;
            };
            let operations = items.iter().map(|item| item.operation.clone()).collect();
            state.in_flight.insert(group.clone(), items);
            batches.push(Batch {
                group,
                executor,
                operations,
            });
        }

        (batches, wake_at)
    }

    /// Returns the queue indices of the batch started by `start`, ascending.
    fn batch_members(&self, state: &QueueState, start: usize, group: &str, now: Instant) -> Vec<usize> {
        let starting = &state.queue[start].operation;
        let comparison_type = starting.group_comparison_type();
        let key_of = |op: &Operation| match comparison_type {
            GroupComparisonType::Create => op.create_comparison_key(),
            GroupComparisonType::Alter => op.modify_comparison_key(),
            GroupComparisonType::None => None,
        };
        let Some(key) = key_of(starting) else {
            return vec![start];
        };

        let mut members = vec![start];
        for (index, item) in state.queue.iter().enumerate().skip(start + 1) {
            let candidate = &item.operation;
            if candidate.group_key() != group
                || !candidate.joins_batches()
                || key_of(candidate).as_deref() != Some(key.as_str())
            {
                continue;
            }
            let joins = match self.readiness(item, now) {
                Readiness::Ready => true,
                // Creates waiting on the user this login creates go with it.
                Readiness::Blocked => {
                    comparison_type == GroupComparisonType::Create
                        && candidate.onesignal_id == starting.onesignal_id
                }
                Readiness::Wait(_) => false,
            };
            if joins {
                members.push(index);
            }
        }
        members
    }

    fn complete(&self, group: &str, response: ExecutionResponse) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(mut items) = state.in_flight.remove(group) else {
                tracing::error!(group, "completion for a batch that is not in flight");
                return;
            };
            let translations = match &response.result {
                ExecutionResult::SuccessWithIdTranslation(map) => Some(map.clone()),
                _ => None,
            };
            let unsent = match response.result {
                ExecutionResult::Success | ExecutionResult::SuccessWithIdTranslation(_) => {
                    response.unsent.min(items.len().saturating_sub(1))
                }
                _ => 0,
            };
            let unsent = items.split_off(items.len() - unsent);

            match response.result {
                ExecutionResult::Success | ExecutionResult::SuccessWithIdTranslation(_) => {
                    let operations = items.into_iter().map(|item| item.resolve(true)).collect();
                    events.push(QueueEvent::Succeeded { operations });
                }
                ExecutionResult::RetryAfter(retry_after) => {
                    let attempt = items.iter().map(|item| item.retries).max().unwrap_or(0) + 1;
                    let delay = self.config.retry.delay_with_floor(attempt, retry_after);
                    let not_before = Instant::now() + delay;
                    let operations: Vec<Operation> =
                        items.iter().map(|item| item.operation.clone()).collect();
                    for mut item in items.into_iter().rev() {
                        item.retries = attempt;
                        item.not_before = Some(not_before);
                        state.queue.push_front(item);
                    }
                    tracing::warn!(group, attempt, ?delay, "batch will be retried");
                    events.push(QueueEvent::Retrying {
                        operations,
                        attempt,
                        delay,
                    });
                }
                ExecutionResult::TerminalFailure(failure) => {
                    let operations: Vec<Operation> =
                        items.into_iter().map(|item| item.resolve(false)).collect();
                    // Ids the batch would have promoted never will be.
                    let abandoned: HashSet<String> = operations
                        .iter()
                        .flat_map(Operation::establishes)
                        .map(str::to_string)
                        .collect();
                    let (orphans, kept): (Vec<_>, Vec<_>) = state
                        .queue
                        .drain(..)
                        .partition(|item| abandoned.iter().any(|id| item.operation.references(id)));
                    state.queue = kept.into();
                    state.abandoned.extend(abandoned);
                    let dropped: Vec<Operation> =
                        orphans.into_iter().map(|item| item.resolve(false)).collect();
                    tracing::error!(
                        group,
                        op = %operations[0],
                        reason = %failure.reason,
                        dropped = dropped.len(),
                        "batch failed"
                    );
                    events.push(QueueEvent::Failed {
                        operations,
                        failure,
                        dropped,
                    });
                }
            }

            for operation in response.follow_ups.into_iter().rev() {
                state.queue.push_front(QueueItem::new(operation));
            }
            if !unsent.is_empty() {
                tracing::debug!(group, count = unsent.len(), "returning unsent operations");
            }
            for item in unsent.into_iter().rev() {
                state.queue.push_front(item);
            }

            if let Some(map) = translations {
                let QueueState {
                    queue, in_flight, ..
                } = &mut *state;
                for item in queue.iter_mut().chain(in_flight.values_mut().flatten()) {
                    item.operation.translate_ids(&map);
                }
                state.translations.extend(map.clone());
                self.persist_translations(&state.translations);
                tracing::info!(count = map.len(), "promoted local ids");
                events.push(QueueEvent::Translated { translations: map });
            }

            self.persist_queue(&state);
        }
        self.wake.notify_one();
        self.emit(events);
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        let mut observers = self.observers.lock();
        observers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    fn persist_queue(&self, state: &QueueState) {
        let Some(prefs) = self.prefs.as_deref() else {
            return;
        };
        let items: Vec<PersistedOperation> = state
            .in_flight
            .values()
            .flatten()
            .chain(state.queue.iter())
            .map(QueueItem::persisted)
            .collect();
        let result = serde_json::to_string(&items)
            .map_err(SyncError::from)
            .and_then(|json| Ok(prefs.set_string(keys::SCOPE, keys::OPERATIONS, Some(&json))?));
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist operation queue");
        }
    }

    fn persist_translations(&self, translations: &BTreeMap<String, String>) {
        let Some(prefs) = self.prefs.as_deref() else {
            return;
        };
        let result = serde_json::to_string(translations)
            .map_err(SyncError::from)
            .and_then(|json| Ok(prefs.set_string(keys::SCOPE, keys::ID_TRANSLATIONS, Some(&json))?));
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist id translations");
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn load_state(prefs: &dyn PreferenceStore) -> QueueState {
    let translations: BTreeMap<String, String> = match read_json(prefs, keys::ID_TRANSLATIONS) {
        Ok(map) => map.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable id translations");
            BTreeMap::new()
        }
    };
    let persisted: Vec<PersistedOperation> = match read_json(prefs, keys::OPERATIONS) {
        Ok(items) => items.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable operation queue");
            Vec::new()
        }
    };

    let queue: VecDeque<QueueItem> = persisted
        .into_iter()
        .map(|mut persisted| {
            persisted.operation.translate_ids(&translations);
            QueueItem {
                retries: persisted.retries,
                ..QueueItem::new(persisted.operation)
            }
        })
        .collect();

    // Operations waiting on an id nothing left in the queue will promote
    // would block forever.
    let promised: HashSet<String> = queue
        .iter()
        .flat_map(|item| item.operation.establishes())
        .map(str::to_string)
        .collect();
    let mut abandoned = HashSet::new();
    let queue = queue
        .into_iter()
        .filter(|item| {
            let missing: Vec<&str> = item
                .operation
                .awaits()
                .into_iter()
                .filter(|id| !promised.contains(*id))
                .collect();
            if missing.is_empty() {
                return true;
            }
            tracing::warn!(op = %item.operation, reason = NEVER_PROMOTED, "discarding persisted operation");
            abandoned.extend(missing.into_iter().map(str::to_string));
            false
        })
        .collect();

    QueueState {
        queue,
        translations,
        abandoned,
        ..QueueState::default()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(prefs: &dyn PreferenceStore, key: &str) -> SyncResult<Option<T>> {
    match prefs.get_string(keys::SCOPE, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use async_trait::async_trait;
    use usersync_core::id::create_local_id;
    use usersync_storage::InMemoryPreferences;

    /// Records batches and answers from a script.
    #[derive(Default)]
    struct ScriptedExecutor {
        batches: Mutex<Vec<Vec<Operation>>>,
        responses: Mutex<VecDeque<ExecutionResponse>>,
    }

    impl ScriptedExecutor {
        fn respond(&self, response: ExecutionResponse) {
            self.responses.lock().push_back(response);
        }

        fn batches(&self) -> Vec<Vec<Operation>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl OperationExecutor for ScriptedExecutor {
        fn operations(&self) -> &'static [OperationName] {
            &OperationName::ALL
        }

        async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
            self.batches.lock().push(operations);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(ExecutionResponse::success)
        }
    }

    fn push_fields(subscription_id: &str) -> crate::operation::SubscriptionFields {
        crate::operation::SubscriptionFields {
            subscription_id: subscription_id.to_string(),
            subscription_type: usersync_core::SubscriptionType::Push,
            address: "token".into(),
            opted_in: true,
            status: 1,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_execution_interval(Duration::ZERO)
            .with_post_create_delay(Duration::ZERO)
            .with_retry(RetryConfig::new(Duration::from_secs(1), Duration::from_secs(30)))
    }

    fn repository(
        executor: Arc<ScriptedExecutor>,
        prefs: Option<Arc<dyn PreferenceStore>>,
    ) -> Arc<OperationRepository> {
        OperationRepository::new(
            config(),
            vec![executor],
            Arc::new(NewRecordsState::new(Duration::ZERO, Duration::from_secs(60))),
            prefs,
        )
    }

    #[test]
    fn coalesces_same_key_to_tail() {
        let repo = repository(Arc::new(ScriptedExecutor::default()), None);
        repo.enqueue(Operation::set_tag("app", "u1", "a", "1"), false);
        repo.enqueue(Operation::set_tag("app", "u1", "b", "1"), false);
        repo.enqueue(Operation::set_tag("app", "u1", "a", "2"), false);

        let pending = repo.pending_operations();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].coalesce_key(), Operation::set_tag("app", "u1", "b", "x").coalesce_key());
        assert!(pending[1].same_intent(&Operation::set_tag("app", "u1", "a", "2")));
    }

    #[tokio::test]
    async fn batches_share_comparison_key() {
        let executor = Arc::new(ScriptedExecutor::default());
        let repo = repository(executor.clone(), None);
        repo.enqueue(Operation::set_tag("app", "u1", "a", "1"), false);
        repo.enqueue(Operation::set_alias("app", "u1", "crm", "1"), false);
        repo.enqueue(Operation::set_tag("app", "u1", "b", "1"), false);
        repo.start().unwrap();

        let done = repo
            .enqueue_and_wait(Operation::set_alias("app", "u1", "crm", "2"), true)
            .await;
        assert!(done);

        let batches = executor.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].name(), OperationName::SetTag);
        assert_eq!(batches[1][0].name(), OperationName::SetAlias);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn translation_unblocks_dependents() {
        let executor = Arc::new(ScriptedExecutor::default());
        let local = create_local_id();
        let mut map = BTreeMap::new();
        map.insert(local.clone(), "user-1".to_string());
        executor.respond(ExecutionResponse::translated(map));

        let repo = repository(executor.clone(), None);
        repo.enqueue(Operation::set_tag("app", &local, "k", "v"), false);
        repo.enqueue(Operation::login_user("app", &local, Some("alice"), None), false);
        repo.start().unwrap();

        let applied = repo
            .enqueue_and_wait(Operation::set_property("app", &local, "language", "fr"), true)
            .await;
        assert!(applied);

        let batches = executor.batches();
        assert_eq!(batches[0][0].name(), OperationName::LoginUser);
        for op in batches.iter().skip(1).flatten() {
            assert_eq!(op.onesignal_id, "user-1");
        }
        assert_eq!(repo.translations().get(&local).map(String::as_str), Some("user-1"));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn login_carries_creates_of_its_user() {
        let executor = Arc::new(ScriptedExecutor::default());
        let repo = repository(executor.clone(), None);
        let local = create_local_id();
        let sub = create_local_id();
        repo.enqueue(Operation::login_user("app", &local, None, None), false);
        repo.enqueue(Operation::create_subscription("app", &local, push_fields(&sub)), false);
        repo.enqueue(Operation::set_tag("app", &local, "k", "v"), false);
        repo.start().unwrap();
        repo.flush();

        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let names: Vec<_> = executor.batches()[0].iter().map(Operation::name).collect();
        assert_eq!(names, vec![OperationName::LoginUser, OperationName::CreateSubscription]);
        repo.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_at_least_retry_after() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.respond(ExecutionResponse::retry(Some(Duration::from_secs(10))));
        let repo = repository(executor.clone(), None);
        let mut events = repo.subscribe();
        repo.start().unwrap();

        let started = Instant::now();
        assert!(repo.enqueue_and_wait(Operation::set_tag("app", "u1", "k", "v"), true).await);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(executor.batches().len(), 2);

        let Some(QueueEvent::Retrying { attempt, delay, .. }) = events.recv().await else {
            panic!("expected a retry event");
        };
        assert_eq!(attempt, 1);
        assert_eq!(delay, Duration::from_secs(10));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn failed_local_login_drops_dependents() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.respond(ExecutionResponse::terminal(OperationFailure::new("rejected")));
        let repo = repository(executor.clone(), None);
        let mut events = repo.subscribe();

        let local = create_local_id();
        repo.enqueue(Operation::login_user("app", &local, None, None), false);
        repo.enqueue(Operation::set_tag("app", &local, "k", "v"), false);
        repo.start().unwrap();

        loop {
            if let Some(QueueEvent::Failed { dropped, .. }) = events.recv().await {
                assert_eq!(dropped.len(), 1);
                break;
            }
        }
        assert!(!repo.any_pending(|op| op.references(&local)));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn unsent_operations_go_back_unresolved() {
        let executor = Arc::new(ScriptedExecutor::default());
        let local = create_local_id();
        let sub = create_local_id();
        let mut map = BTreeMap::new();
        map.insert(local.clone(), "user-1".to_string());
        executor.respond(ExecutionResponse::translated(map).with_unsent(1));

        let repo = repository(executor.clone(), None);
        let mut events = repo.subscribe();
        repo.enqueue(Operation::login_user("app", &local, None, None), false);
        repo.enqueue(Operation::create_subscription("app", &local, push_fields(&sub)), false);
        repo.start().unwrap();
        repo.flush();

        let mut succeeded = Vec::new();
        while succeeded.len() < 2 {
            if let Some(QueueEvent::Succeeded { operations }) = events.recv().await {
                succeeded.push(operations);
            }
        }
        let names: Vec<Vec<OperationName>> = succeeded
            .iter()
            .map(|batch| batch.iter().map(Operation::name).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec![OperationName::LoginUser], vec![OperationName::CreateSubscription]]
        );
        assert_eq!(succeeded[1][0].onesignal_id, "user-1");

        let batches = executor.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1][0].id, batches[0][1].id);
        assert!(repo.is_empty());
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn failed_subscription_create_drops_its_dependents() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.respond(ExecutionResponse::terminal(OperationFailure::new("rejected")));
        let repo = repository(executor.clone(), None);
        let mut events = repo.subscribe();

        let sub = create_local_id();
        repo.enqueue(Operation::create_subscription("app", "user-1", push_fields(&sub)), false);
        repo.enqueue(Operation::delete_subscription("app", "user-1", &sub), false);
        repo.start().unwrap();
        repo.flush();

        loop {
            if let Some(QueueEvent::Failed { dropped, .. }) = events.recv().await {
                assert_eq!(dropped.len(), 1);
                assert_eq!(dropped[0].name(), OperationName::DeleteSubscription);
                break;
            }
        }
        assert!(repo.is_empty());

        // Later edits of the never-created subscription are refused.
        let applied = repo
            .enqueue_and_wait(Operation::update_subscription("app", "user-1", push_fields(&sub)), true)
            .await;
        assert!(!applied);
        assert!(repo.is_empty());
        assert_eq!(executor.batches().len(), 1);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn reload_discards_operations_no_create_will_unblock() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let sub = create_local_id();
        {
            let repo = repository(Arc::new(ScriptedExecutor::default()), Some(prefs.clone()));
            repo.enqueue(Operation::delete_subscription("app", "user-1", &sub), false);
            repo.enqueue(Operation::set_tag("app", "user-1", "k", "v"), false);
        }

        let repo = repository(Arc::new(ScriptedExecutor::default()), Some(prefs));
        let pending = repo.pending_operations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name(), OperationName::SetTag);
        assert!(
            !repo
                .enqueue_and_wait(Operation::update_subscription("app", "user-1", push_fields(&sub)), true)
                .await
        );
    }

    #[tokio::test]
    async fn persisted_queue_resumes_with_translations() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let local = create_local_id();
        {
            let repo = repository(Arc::new(ScriptedExecutor::default()), Some(prefs.clone()));
            repo.enqueue(Operation::set_tag("app", &local, "k", "v"), false);
        }
        let mut map = BTreeMap::new();
        map.insert(local.clone(), "user-7".to_string());
        prefs
            .set_string(
                keys::SCOPE,
                keys::ID_TRANSLATIONS,
                Some(&serde_json::to_string(&map).unwrap()),
            )
            .unwrap();

        let repo = repository(Arc::new(ScriptedExecutor::default()), Some(prefs));
        let pending = repo.pending_operations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].onesignal_id, "user-7");
    }

    #[tokio::test]
    async fn unreadable_queue_is_discarded() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        prefs
            .set_string(keys::SCOPE, keys::OPERATIONS, Some("not json"))
            .unwrap();
        let repo = repository(Arc::new(ScriptedExecutor::default()), Some(prefs));
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let repo = repository(Arc::new(ScriptedExecutor::default()), None);
        repo.start().unwrap();
        assert!(matches!(repo.start(), Err(SyncError::AlreadyStarted)));
        repo.shutdown().await;
    }

    #[test]
    fn start_needs_runtime() {
        let repo = repository(Arc::new(ScriptedExecutor::default()), None);
        assert!(matches!(repo.start(), Err(SyncError::NoRuntime)));
    }
}
