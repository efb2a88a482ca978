//! Local placeholder ids.
//!
//! A local id stands in for a backend-assigned id until the backend has
//! created the record. Operations carrying a local id cannot be sent
//! until the id is promoted.

use uuid::Uuid;

/// Prefix shared by every local id.
pub const LOCAL_PREFIX: &str = "local-";

/// Creates a fresh local id.
pub fn create_local_id() -> String {
    format!("{LOCAL_PREFIX}{}", Uuid::new_v4())
}

/// Returns true if `id` was created by [`create_local_id`].
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_unique_and_recognised() {
        let a = create_local_id();
        let b = create_local_id();
        assert_ne!(a, b);
        assert!(is_local_id(&a));
        assert!(!is_local_id("0b9a3c2e-6f5d-4f6e-9a1b-4c1d2e3f4a5b"));
    }
}
