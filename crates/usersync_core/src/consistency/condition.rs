//! Read-your-write tokens and the conditions evaluated over them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Kind of write a token acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// A user create or update.
    UserUpdate,
    /// A subscription create or update.
    SubscriptionUpdate,
}

/// An opaque read-your-write token returned by the backend.
///
/// Numeric tokens compare numerically and order before every non-numeric
/// token; non-numeric tokens compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RywToken(String);

impl RywToken {
    /// Wraps a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for RywToken {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u128>(), other.0.parse::<u128>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for RywToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RywToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RywToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RywToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Tokens of one entity, by kind.
pub type EntityTokens = HashMap<TokenKind, RywToken>;

/// `entity id -> kind -> newest token`.
pub type TokenMap = HashMap<String, EntityTokens>;

/// Something a caller can wait on until its tokens are visible.
///
/// Both methods are evaluated under the manager's lock, so they must not
/// block or call back into the manager.
pub trait Condition: Send {
    /// Identifies the condition for [`super::ConsistencyManager::resolve_conditions_with_id`].
    fn id(&self) -> &str;

    /// Returns true once the condition holds.
    fn is_met(&self, tokens: &TokenMap) -> bool;

    /// Returns the token the waiter is resolved with.
    fn newest_token(&self, tokens: &TokenMap) -> Option<RywToken>;
}

/// A boolean test over one entity's tokens.
pub trait TokenPredicate: Send + Sync {
    /// Returns true if the predicate holds.
    fn holds(&self, tokens: &EntityTokens) -> bool;
}

/// Holds when a token of the given kind is present.
#[derive(Debug, Clone, Copy)]
pub struct TokenPresent(pub TokenKind);

impl TokenPredicate for TokenPresent {
    fn holds(&self, tokens: &EntityTokens) -> bool {
        tokens.contains_key(&self.0)
    }
}

/// Holds when every inner predicate holds.
pub struct AllOf(pub Vec<Box<dyn TokenPredicate>>);

impl TokenPredicate for AllOf {
    fn holds(&self, tokens: &EntityTokens) -> bool {
        self.0.iter().all(|p| p.holds(tokens))
    }
}

/// Holds when at least one inner predicate holds.
pub struct AnyOf(pub Vec<Box<dyn TokenPredicate>>);

impl TokenPredicate for AnyOf {
    fn holds(&self, tokens: &EntityTokens) -> bool {
        self.0.iter().any(|p| p.holds(tokens))
    }
}

/// A predicate over one entity's tokens, resolved with the greatest token
/// among `newest_of`.
pub struct EntityCondition {
    id: String,
    entity_id: String,
    predicate: Box<dyn TokenPredicate>,
    newest_of: Vec<TokenKind>,
}

impl EntityCondition {
    /// Creates a condition.
    pub fn new(
        id: impl Into<String>,
        entity_id: impl Into<String>,
        predicate: impl TokenPredicate + 'static,
        newest_of: Vec<TokenKind>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            predicate: Box::new(predicate),
            newest_of,
        }
    }

    /// Returns the entity this condition watches.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl Condition for EntityCondition {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_met(&self, tokens: &TokenMap) -> bool {
        tokens
            .get(&self.entity_id)
            .is_some_and(|entity| self.predicate.holds(entity))
    }

    fn newest_token(&self, tokens: &TokenMap) -> Option<RywToken> {
        let entity = tokens.get(&self.entity_id)?;
        self.newest_of
            .iter()
            .filter_map(|kind| entity.get(kind))
            .max()
            .cloned()
    }
}

/// Met when a user's writes are visible to segment membership reads.
///
/// Requires the user-update token, plus the subscription-update token when
/// a subscription write was part of the session.
pub struct SegmentationReadyCondition(EntityCondition);

impl SegmentationReadyCondition {
    /// Condition id shared by every instance.
    pub const ID: &'static str = "segmentation_ready";

    /// Creates the condition for `onesignal_id`.
    pub fn new(onesignal_id: impl Into<String>, requires_subscription: bool) -> Self {
        let kinds = vec![TokenKind::UserUpdate, TokenKind::SubscriptionUpdate];
        let condition = if requires_subscription {
            EntityCondition::new(
                Self::ID,
                onesignal_id,
                AllOf(vec![
                    Box::new(TokenPresent(TokenKind::UserUpdate)),
                    Box::new(TokenPresent(TokenKind::SubscriptionUpdate)),
                ]),
                kinds,
            )
        } else {
            EntityCondition::new(Self::ID, onesignal_id, TokenPresent(TokenKind::UserUpdate), kinds)
        };
        Self(condition)
    }
}

impl Condition for SegmentationReadyCondition {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn is_met(&self, tokens: &TokenMap) -> bool {
        self.0.is_met(tokens)
    }

    fn newest_token(&self, tokens: &TokenMap) -> Option<RywToken> {
        self.0.newest_token(tokens)
    }
}
