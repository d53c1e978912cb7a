//! Core error types for litstore-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! ways a literal can fail validation at the storage boundary.

use crate::hash::Hash;
use thiserror::Error;

/// Core errors produced by the litstore-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation literal arrived without its causal-history header.
    #[error("missing causal history header for op {op_hash}")]
    MissingOpHeader { op_hash: Hash },

    /// A literal is missing a field the storage layer needs to index it.
    #[error("malformed literal {hash}: {reason}")]
    MalformedLiteral { hash: Hash, reason: String },
}
