//! Records the backend created moments ago.
//!
//! The backend replicates new records asynchronously. Calls addressing a
//! record right after its creation can 404 or read stale data, so the queue
//! holds them back for `post_create_delay`, and executors treat a 404
//! within `missing_retry_window` of creation as lag rather than loss.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Creation times of recently created records.
pub struct NewRecordsState {
    records: Mutex<HashMap<String, Instant>>,
    post_create_delay: Duration,
    missing_retry_window: Duration,
}

impl NewRecordsState {
    /// Creates an empty state.
    pub fn new(post_create_delay: Duration, missing_retry_window: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            post_create_delay,
            missing_retry_window,
        }
    }

    /// Records that `id` was just created.
    pub fn add(&self, id: &str) {
        self.records.lock().insert(id.to_string(), Instant::now());
    }

    /// Returns the instant from which `id` may be addressed, if that is
    /// still in the future.
    pub fn accessible_at(&self, id: &str) -> Option<Instant> {
        let created = *self.records.lock().get(id)?;
        let at = created + self.post_create_delay;
        (at > Instant::now()).then_some(at)
    }

    /// Returns true if `id` may be addressed now.
    pub fn can_access(&self, id: &str) -> bool {
        self.accessible_at(id).is_none()
    }

    /// Returns true if `id` was created within the missing-record window.
    pub fn is_in_missing_retry_window(&self, id: &str) -> bool {
        self.records
            .lock()
            .get(id)
            .is_some_and(|created| created.elapsed() <= self.missing_retry_window)
    }

    /// Drops records older than both windows.
    pub fn prune(&self) {
        let horizon = self.post_create_delay.max(self.missing_retry_window);
        self.records
            .lock()
            .retain(|_, created| created.elapsed() <= horizon);
    }
}
