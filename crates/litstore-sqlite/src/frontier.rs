//! Causal frontier (terminal ops) per mutable object.
//!
//! The frontier of a mutable object is the set of its stored operations
//! that no other stored operation lists in `prevOps`. It is maintained
//! incrementally inside the store transaction of each new operation.

use indexmap::IndexSet;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use litstore_core::Hash;

use crate::error::StorageError;

/// Frontier record as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOps {
    /// Current heads of the operation DAG, in insertion order.
    #[serde(rename = "terminalOps")]
    pub terminal_ops: Vec<Hash>,
    /// The most recently stored operation for the object.
    #[serde(rename = "lastOp")]
    pub last_op: Hash,
}

impl TerminalOps {
    pub fn contains(&self, op: &Hash) -> bool {
        self.terminal_ops.contains(op)
    }
}

/// Folds a newly stored operation into its target's frontier.
pub(crate) fn apply_operation(
    tx: &Transaction<'_>,
    target: &Hash,
    prev_ops: &[Hash],
    op_hash: &Hash,
) -> Result<(), StorageError> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT terminal_ops FROM terminal_ops WHERE mutable_object_hash = ?1",
            params![target.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let mut frontier: IndexSet<Hash> = match stored {
        Some(json) => serde_json::from_str(&json)?,
        None => IndexSet::new(),
    };

    for prev in prev_ops {
        frontier.shift_remove(prev);
    }

    if !frontier.insert(op_hash.clone()) {
        tracing::warn!(
            mutable = %target,
            op = %op_hash,
            "operation already present in terminal ops"
        );
    }

    tx.execute(
        "INSERT INTO terminal_ops (mutable_object_hash, terminal_ops, last_op) VALUES (?1, ?2, ?3) \
         ON CONFLICT(mutable_object_hash) DO UPDATE SET terminal_ops = excluded.terminal_ops, last_op = excluded.last_op",
        params![target.as_str(), serde_json::to_string(&frontier)?, op_hash.as_str()],
    )?;

    Ok(())
}

pub(crate) fn load(conn: &Connection, mutable: &Hash) -> Result<Option<TerminalOps>, StorageError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT terminal_ops, last_op FROM terminal_ops WHERE mutable_object_hash = ?1",
            params![mutable.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((terminal_ops, last_op)) => Ok(Some(TerminalOps {
            terminal_ops: serde_json::from_str(&terminal_ops)?,
            last_op: Hash(last_op),
        })),
        None => Ok(None),
    }
}
