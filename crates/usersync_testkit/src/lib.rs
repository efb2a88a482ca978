//! # usersync testkit
//!
//! Test utilities for usersync.
//!
//! This crate provides:
//! - [`TestHarness`]: a core wired to in-memory preferences and a
//!   [`MockBackend`](usersync_engine::MockBackend), with every delay zeroed
//! - [`TempPreferences`]: file-backed preferences in a temporary directory
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use usersync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn tags_reach_the_backend() {
//!     let harness = TestHarness::started();
//!     harness.core.add_tag("level", "3");
//!     harness.settle().await;
//!     assert_eq!(harness.backend.call_count("update_user"), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
