//! Session model.

use super::store_model;
use crate::model::Model;

/// The current application session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionModel(Model);

store_model!(SessionModel);

impl SessionModel {
    /// Property holding the session id.
    pub const SESSION_ID: &'static str = "session_id";
    /// Property holding the session start, in milliseconds since the epoch.
    pub const STARTED_AT: &'static str = "started_at";
    /// Property marking whether the session is still open.
    pub const IS_VALID: &'static str = "is_valid";

    /// Returns the session id.
    pub fn session_id(&self) -> Option<&str> {
        self.0.get_string(Self::SESSION_ID)
    }

    /// Returns the session start time.
    pub fn started_at(&self) -> i64 {
        self.0.get_int(Self::STARTED_AT)
    }

    /// Returns true while the session is open.
    pub fn is_valid(&self) -> bool {
        self.0.get_bool(Self::IS_VALID)
    }

    /// Opens a new session.
    pub fn start(&mut self, session_id: &str, started_at: i64) {
        self.0.set(Self::SESSION_ID, session_id);
        self.0.set(Self::STARTED_AT, started_at);
        self.0.set(Self::IS_VALID, true);
    }

    /// Closes the session.
    pub fn end(&mut self) {
        self.0.set(Self::IS_VALID, false);
    }
}
