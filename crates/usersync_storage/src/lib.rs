//! # usersync storage
//!
//! Scoped key-value preference storage for the usersync state core.
//!
//! This crate is the persistence boundary of the sync core. Stores are
//! **opaque value stores**: the model stores and the operation queue
//! serialize themselves to strings and hand them over; the backend never
//! interprets them.
//!
//! ## Design Principles
//!
//! - Values are addressed by `(scope, key)`
//! - Five value shapes: string, bool, int, long, string-set
//! - Writing `None` removes the key
//! - Every `set_*` is durable when it returns
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`InMemoryPreferences`] - For testing and ephemeral state
//! - [`FilePreferences`] - A JSON document on disk, rewritten atomically
//!
//! ## Example
//!
//! ```rust
//! use usersync_storage::{InMemoryPreferences, PreferenceStore};
//!
//! let prefs = InMemoryPreferences::new();
//! prefs.set_string("usersync", "greeting", Some("hello")).unwrap();
//! assert_eq!(
//!     prefs.get_string("usersync", "greeting").unwrap().as_deref(),
//!     Some("hello")
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod preferences;

pub use error::{StorageError, StorageResult};
pub use file::FilePreferences;
pub use memory::InMemoryPreferences;
pub use preferences::{keys, PreferenceStore, PreferenceValue};
