//! # usersync engine
//!
//! Durable outgoing-operation queue for the usersync client.
//!
//! This crate provides:
//! - [`Operation`]: the closed set of mutations sent to the backend
//! - [`OperationRepository`]: a persisted queue that coalesces, groups,
//!   orders and retries operations
//! - Executors turning batches of operations into backend calls
//! - The backend boundary ([`UserBackend`], [`IdentityBackend`],
//!   [`SubscriptionBackend`]) with an HTTP and an in-process implementation
//! - [`RebuildService`]: recreates a user the backend lost
//! - [`UserSyncCore`]: the composition root wiring all of it together
//!
//! ## Architecture
//!
//! Application edits land in the user stores with the `Normal` tag. Store
//! listeners turn them into operations and enqueue them. A worker drains
//! the queue per user, promoting local placeholder ids to backend ids as
//! creates succeed, and executors hydrate the stores from responses with
//! the `Hydrate` tag so nothing echoes back.
//!
//! ## Key Invariants
//!
//! - Per user, operations reach the backend in enqueue order
//! - A user is created before any operation addressing it is sent
//! - Id promotion rewrites the whole queue under the dequeue lock
//! - Retryable failures are retried with backoff and never dropped
//! - Read-your-write tokens are recorded before a batch completes

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
mod client;
mod config;
mod error;
pub mod executor;
mod listeners;
mod new_records;
mod operation;
mod rebuild;
mod repository;
mod stores;

pub use backend::{
    BackendCall, BackendError, BackendResult, Backends, ErrorClass, HttpBackend, HttpClient,
    IdentityBackend, MockBackend, SubscriptionBackend, UserBackend,
};
pub use client::UserSyncCore;
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use executor::{
    ExecutionResponse, ExecutionResult, ExecutorContext, OperationExecutor, OperationFailure,
};
pub use listeners::{subscribe_listeners, IdentityListener, PropertiesListener, SubscriptionListener};
pub use new_records::NewRecordsState;
pub use operation::{GroupComparisonType, Operation, OperationKind, OperationName, SubscriptionFields};
pub use rebuild::RebuildService;
pub use repository::{OperationRepository, QueueEvent};
pub use stores::UserStores;
