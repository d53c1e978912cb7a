//! The [`Backend`] trait: the storage contract the object-store runtime
//! consumes.
//!
//! Methods return boxed futures so the trait stays object-safe and the
//! runtime can hold a `Box<dyn Backend>` / `Arc<dyn Backend>`.

use std::future::Future;
use std::pin::Pin;

use litstore_core::{Hash, Literal, StoredOpHeader};

use crate::error::StorageError;
use crate::frontier::TerminalOps;
use crate::index::{SearchParams, SearchResults};
use crate::monitor::StoredObjectCallback;

/// Boxed result future returned by [`Backend`] methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Durable storage for literals, their indices, op headers and causal
/// frontiers.
pub trait Backend: Send + Sync {
    /// Identifies the backend implementation (e.g. `"sqlite"`).
    fn backend_name(&self) -> &'static str;

    /// Identifies this particular store (file name or generated id).
    fn name(&self) -> &str;

    /// Persists `literal` exactly once. Operations must carry `op_header`.
    fn store<'a>(
        &'a self,
        literal: Literal,
        op_header: Option<StoredOpHeader>,
    ) -> BackendFuture<'a, ()>;

    fn load<'a>(&'a self, hash: &'a Hash) -> BackendFuture<'a, Option<Literal>>;

    fn load_op_header<'a>(&'a self, op_hash: &'a Hash) -> BackendFuture<'a, Option<StoredOpHeader>>;

    fn load_op_header_by_header_hash<'a>(
        &'a self,
        header_hash: &'a Hash,
    ) -> BackendFuture<'a, Option<StoredOpHeader>>;

    fn load_terminal_ops_for_mutable<'a>(
        &'a self,
        mutable: &'a Hash,
    ) -> BackendFuture<'a, Option<TerminalOps>>;

    fn search_by_class<'a>(
        &'a self,
        class_name: &'a str,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults>;

    fn search_by_reference<'a>(
        &'a self,
        referring_path: &'a str,
        referenced_hash: &'a Hash,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults>;

    fn search_by_referencing_class<'a>(
        &'a self,
        referring_class: &'a str,
        referring_path: &'a str,
        referenced_hash: &'a Hash,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults>;

    /// Replaces the callback invoked for newly durable literals.
    fn set_stored_object_callback(&self, callback: StoredObjectCallback);

    /// Resolves once the schema is in place.
    fn ready<'a>(&'a self) -> BackendFuture<'a, ()>;

    /// Detaches from the shared-file monitor.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
