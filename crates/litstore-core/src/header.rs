//! Causal-history headers attached to operation literals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::Hash;

/// Header payload describing where an operation sits in its causal history.
///
/// Only `headerHash` is load-bearing for storage (it is the primary key of
/// the header table); the rest is persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpHeaderLiteral {
    #[serde(rename = "opHash")]
    pub op_hash: Hash,
    #[serde(rename = "headerHash")]
    pub header_hash: Hash,
    #[serde(rename = "prevOpHeaders", default)]
    pub prev_op_headers: Vec<Hash>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The header as handed to and returned from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpHeader {
    pub literal: OpHeaderLiteral,
}

impl StoredOpHeader {
    pub fn new(op_hash: impl Into<Hash>, header_hash: impl Into<Hash>) -> Self {
        StoredOpHeader {
            literal: OpHeaderLiteral {
                op_hash: op_hash.into(),
                header_hash: header_hash.into(),
                prev_op_headers: Vec::new(),
                extra: Map::new(),
            },
        }
    }

    pub fn with_prev_headers(mut self, prev: impl IntoIterator<Item = Hash>) -> Self {
        self.literal.prev_op_headers.extend(prev);
        self
    }

    pub fn header_hash(&self) -> &Hash {
        &self.literal.header_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_uses_camel_case_keys() {
        let header = StoredOpHeader::new("op1", "hdr1").with_prev_headers([Hash::from("hdr0")]);
        let json = serde_json::to_value(&header.literal).unwrap();
        assert_eq!(
            json,
            json!({"opHash": "op1", "headerHash": "hdr1", "prevOpHeaders": ["hdr0"]})
        );
    }

    #[test]
    fn computed_props_are_kept() {
        let raw = json!({
            "opHash": "op1",
            "headerHash": "hdr1",
            "prevOpHeaders": [],
            "computedProps": {"height": 3, "size": 1}
        });
        let header: OpHeaderLiteral = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(header.extra["computedProps"]["height"], json!(3));
        assert_eq!(serde_json::to_value(&header).unwrap(), raw);
    }
}
