//! SQLite storage backend for content-addressed literals.
//!
//! Provides the [`Backend`] trait the object-store runtime consumes and
//! [`SqliteBackend`], which persists literals to a local SQLite file (or a
//! private in-memory database) and keeps the indices the runtime queries.
//!
//! # Architecture
//!
//! Each store writes, in one immediate transaction:
//! - the append-only object log (`objects`), whose autoincrement sequence
//!   doubles as the paging cursor;
//! - the secondary index (`object_lookup`) with `class`, `references` and
//!   `referencing-class` keys;
//! - for operations, the op header (`op_headers`) and the target's causal
//!   frontier (`terminal_ops`).
//!
//! Backends opened on the same file share one [`FileMonitor`] that polls
//! the log and delivers every newly durable literal exactly once to each
//! attached backend's callback, including rows written by other processes.
//!
//! # Modules
//!
//! - [`error`]: StorageError and transient/fatal classification
//! - [`config`]: BackendConfig, env overrides
//! - [`retry`]: RetryPolicy, Backoff and the Clock seam
//! - [`schema`]: migrations and connection setup
//! - [`index`]: index key derivation and paged search
//! - [`frontier`]: terminal ops maintenance
//! - [`monitor`]: shared-file monitor and its registry
//! - [`traits`]: Backend trait definition
//! - [`sqlite`]: SqliteBackend implementation

pub mod config;
pub mod error;
pub mod frontier;
pub mod index;
pub mod monitor;
pub mod retry;
pub mod schema;
pub mod sqlite;
pub mod traits;

// Re-export key types for ergonomic use.
pub use config::BackendConfig;
pub use error::StorageError;
pub use frontier::TerminalOps;
pub use index::{IndexKind, SearchOrder, SearchParams, SearchResults};
pub use monitor::{stored_object_callback, FileMonitor, MonitorRegistry, StoredObjectCallback};
pub use retry::{Backoff, Clock, RetryPolicy, TokioClock};
pub use sqlite::{SqliteBackend, MEMORY};
pub use traits::{Backend, BackendFuture};

pub use litstore_core::{Dependency, Hash, Literal, OpHeaderLiteral, StoredOpHeader};
