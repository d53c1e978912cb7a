//! Classification of a literal at the store boundary.
//!
//! [`LiteralKind::classify`] is called once per store request. Everything
//! downstream matches on the variant instead of re-reading `_flags`.

use serde_json::Value;

use crate::error::CoreError;
use crate::hash::Hash;
use crate::header::StoredOpHeader;
use crate::literal::Literal;

/// What a literal means to the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralKind<'a> {
    /// An ordinary immutable record.
    Plain,
    /// A mutation event on a mutable object.
    Operation(OperationRecord<'a>),
}

/// The parts of an operation the causal frontier needs.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord<'a> {
    /// Hash of the mutable object this operation targets.
    pub target: Hash,
    /// Declared causal predecessors.
    pub prev_ops: Vec<Hash>,
    /// Causal-history header that must be stored alongside the op.
    pub header: &'a StoredOpHeader,
}

impl<'a> LiteralKind<'a> {
    /// Resolves the kind of `literal`.
    ///
    /// Fails if `_class` is missing, if an operation has no header, or if an
    /// operation does not name its target object.
    pub fn classify(
        literal: &Literal,
        header: Option<&'a StoredOpHeader>,
    ) -> Result<LiteralKind<'a>, CoreError> {
        if literal.class_name().is_none() {
            return Err(CoreError::MalformedLiteral {
                hash: literal.hash.clone(),
                reason: "payload has no _class".to_string(),
            });
        }

        if !literal.is_op() {
            return Ok(LiteralKind::Plain);
        }

        let header = header.ok_or_else(|| CoreError::MissingOpHeader {
            op_hash: literal.hash.clone(),
        })?;

        let fields = literal.fields();

        let target = fields
            .and_then(|f| f.get("targetObject"))
            .and_then(reference_hash)
            .ok_or_else(|| CoreError::MalformedLiteral {
                hash: literal.hash.clone(),
                reason: "operation has no targetObject reference".to_string(),
            })?;

        // prevOps is a hashed set of hash references: {"_elements": [{"_hash": ..}, ..]}.
        // The very first op on an object carries no predecessors at all.
        let prev_ops = match fields.and_then(|f| f.get("prevOps")) {
            None | Some(Value::Null) => Vec::new(),
            Some(set) => set
                .get("_elements")
                .and_then(Value::as_array)
                .ok_or_else(|| CoreError::MalformedLiteral {
                    hash: literal.hash.clone(),
                    reason: "prevOps is not a hashed set".to_string(),
                })?
                .iter()
                .map(|element| {
                    reference_hash(element).ok_or_else(|| CoreError::MalformedLiteral {
                        hash: literal.hash.clone(),
                        reason: "prevOps element is not a hash reference".to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(LiteralKind::Operation(OperationRecord {
            target,
            prev_ops,
            header,
        }))
    }

    pub fn is_operation(&self) -> bool {
        matches!(self, LiteralKind::Operation(_))
    }
}

fn reference_hash(value: &Value) -> Option<Hash> {
    value.get("_hash").and_then(Value::as_str).map(Hash::from)
}
