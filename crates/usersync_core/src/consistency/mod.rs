//! Read-your-write consistency.
//!
//! The backend answers accepted writes with a token. A reader that must see
//! its own writes registers a [`Condition`] and awaits the returned
//! [`ConditionFuture`]; the future resolves on the [`ConsistencyManager::set_token`]
//! call that first satisfies the condition.

mod condition;

pub use condition::{
    AllOf, AnyOf, Condition, EntityCondition, EntityTokens, RywToken, SegmentationReadyCondition,
    TokenKind, TokenMap, TokenPredicate, TokenPresent,
};

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

struct Waiter {
    condition: Box<dyn Condition>,
    sender: oneshot::Sender<Option<RywToken>>,
}

#[derive(Default)]
struct State {
    tokens: TokenMap,
    waiters: Vec<Waiter>,
}

impl State {
    fn sweep(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if waiter.sender.is_closed() {
                continue;
            }
            if waiter.condition.is_met(&self.tokens) {
                let token = waiter.condition.newest_token(&self.tokens);
                tracing::debug!(condition = waiter.condition.id(), token = ?token, "condition met");
                let _ = waiter.sender.send(token);
            } else {
                self.waiters.push(waiter);
            }
        }
    }
}

/// Tracks read-your-write tokens and resolves conditions waiting on them.
///
/// Token writes and condition evaluation share one lock: a condition that
/// becomes true is resolved by the same `set_token` call that made it true,
/// and a registration racing a `set_token` never misses it.
#[derive(Default)]
pub struct ConsistencyManager {
    state: Mutex<State>,
}

impl ConsistencyManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `token` for `entity_id` and resolves satisfied conditions.
    ///
    /// An older token than the one already held for the kind is ignored.
    pub fn set_token(&self, entity_id: &str, kind: TokenKind, token: RywToken) {
        let mut state = self.state.lock();
        let slot = state
            .tokens
            .entry(entity_id.to_string())
            .or_default()
            .entry(kind)
            .or_insert_with(|| token.clone());
        if token > *slot {
            *slot = token;
        }
        state.sweep();
    }

    /// Registers a condition. The future resolves immediately if the
    /// condition already holds.
    pub fn register_condition(&self, condition: impl Condition + 'static) -> ConditionFuture {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        if condition.is_met(&state.tokens) {
            let _ = sender.send(condition.newest_token(&state.tokens));
        } else {
            state.waiters.push(Waiter {
                condition: Box::new(condition),
                sender,
            });
        }
        ConditionFuture { receiver }
    }

    /// Resolves every pending condition with id `condition_id` to `None`.
    ///
    /// Returns the number of waiters released.
    pub fn resolve_conditions_with_id(&self, condition_id: &str) -> usize {
        let mut state = self.state.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
            .into_iter()
            .partition(|w| w.condition.id() == condition_id);
        state.waiters = rest;
        let released = matching.len();
        for waiter in matching {
            let _ = waiter.sender.send(None);
        }
        released
    }

    /// Returns a copy of the tokens held for `entity_id`.
    pub fn tokens(&self, entity_id: &str) -> EntityTokens {
        self.state
            .lock()
            .tokens
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of unresolved conditions.
    pub fn pending_count(&self) -> usize {
        let mut state = self.state.lock();
        state.waiters.retain(|w| !w.sender.is_closed());
        state.waiters.len()
    }
}

/// Resolves to the condition's newest token once it is met, or `None` if
/// the condition was released or the manager dropped.
#[must_use = "a condition future does nothing unless awaited"]
pub struct ConditionFuture {
    receiver: oneshot::Receiver<Option<RywToken>>,
}

impl Future for ConditionFuture {
    type Output = Option<RywToken>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.ok().flatten())
    }
}

/// Awaits `future` for at most `timeout`. Elapsing yields `None`.
pub async fn wait_with_timeout(future: ConditionFuture, timeout: Duration) -> Option<RywToken> {
    match tokio::time::timeout(timeout, future).await {
        Ok(token) => token,
        Err(_) => {
            tracing::debug!(?timeout, "consistency wait timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolves_on_the_satisfying_set() {
        let manager = ConsistencyManager::new();
        let mut future = manager.register_condition(EntityCondition::new(
            "c",
            "u",
            TokenPresent(TokenKind::UserUpdate),
            vec![TokenKind::UserUpdate],
        ));

        manager.set_token("u", TokenKind::SubscriptionUpdate, "1".into());
        let early = tokio::time::timeout(Duration::from_millis(10), &mut future).await;
        assert!(early.is_err());
        assert_eq!(manager.pending_count(), 1);

        manager.set_token("u", TokenKind::UserUpdate, "5".into());
        assert_eq!(future.await, Some(RywToken::from("5")));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn already_met_resolves_immediately() {
        let manager = ConsistencyManager::new();
        manager.set_token("u", TokenKind::UserUpdate, "7".into());
        let future = manager.register_condition(SegmentationReadyCondition::new("u", false));
        assert_eq!(future.await, Some(RywToken::from("7")));
    }

    #[test]
    fn keeps_newest_token() {
        let manager = ConsistencyManager::new();
        manager.set_token("u", TokenKind::UserUpdate, "10".into());
        manager.set_token("u", TokenKind::UserUpdate, "9".into());
        assert_eq!(manager.tokens("u")[&TokenKind::UserUpdate], RywToken::from("10"));
        assert!(manager.tokens("other").is_empty());
    }

    #[tokio::test]
    async fn release_by_id() {
        let manager = ConsistencyManager::new();
        let future = manager.register_condition(SegmentationReadyCondition::new("u", true));
        let other = manager.register_condition(EntityCondition::new(
            "other",
            "u",
            TokenPresent(TokenKind::UserUpdate),
            vec![TokenKind::UserUpdate],
        ));

        assert_eq!(manager.resolve_conditions_with_id(SegmentationReadyCondition::ID), 1);
        assert_eq!(future.await, None);
        assert_eq!(manager.pending_count(), 1);
        drop(other);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_none() {
        let manager = ConsistencyManager::new();
        let future = manager.register_condition(SegmentationReadyCondition::new("u", false));
        assert_eq!(wait_with_timeout(future, Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn concurrent_setters_and_waiters() {
        let manager = Arc::new(ConsistencyManager::new());
        let mut waits = Vec::new();
        for i in 0..16 {
            let entity = format!("u{i}");
            waits.push(manager.register_condition(SegmentationReadyCondition::new(entity, true)));
        }

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let entity = format!("u{i}");
                manager.set_token(&entity, TokenKind::UserUpdate, "1".into());
                manager.set_token(&entity, TokenKind::SubscriptionUpdate, "2".into());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for wait in waits {
            assert_eq!(wait.await, Some(RywToken::from("2")));
        }
    }

    proptest::proptest! {
        #[test]
        fn held_token_is_the_newest_set(tokens in proptest::collection::vec(0u64..1_000_000, 1..20)) {
            let manager = ConsistencyManager::new();
            for token in &tokens {
                manager.set_token("u", TokenKind::UserUpdate, RywToken::new(token.to_string()));
            }
            let newest = tokens.iter().max().map(|t| RywToken::new(t.to_string()));
            proptest::prop_assert_eq!(manager.tokens("u").get(&TokenKind::UserUpdate).cloned(), newest);
        }
    }
}
