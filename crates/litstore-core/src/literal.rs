//! The literal record as seen by the storage layer.
//!
//! A [`Literal`] is produced upstream by the object model: its hash,
//! dependency list, class and flags are all computed there. Storage only
//! reads `hash`, `value._class`, `value._flags`, `value._fields` and the
//! dependency triples. Every other top-level field (author, signature, ...)
//! is preserved verbatim through `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::Hash;

/// Flag marking a literal as an operation on a mutable object.
pub const OP_FLAG: &str = "op";

/// A hash reference from one literal to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Hash of the referenced literal.
    pub hash: Hash,
    /// Field path inside the referencing literal.
    pub path: String,
    /// Class name of the referenced literal.
    #[serde(rename = "className")]
    pub class_name: String,
    /// Fields the storage layer does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Dependency {
    pub fn new(hash: impl Into<Hash>, path: impl Into<String>, class_name: impl Into<String>) -> Self {
        Dependency {
            hash: hash.into(),
            path: path.into(),
            class_name: class_name.into(),
            extra: Map::new(),
        }
    }
}

/// An immutable, content-addressed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub hash: Hash,
    pub value: Value,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Literal {
    pub fn new(hash: impl Into<Hash>, value: Value) -> Self {
        Literal {
            hash: hash.into(),
            value,
            dependencies: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Builder-style helper appending a dependency.
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// The `_class` of the payload, if present.
    pub fn class_name(&self) -> Option<&str> {
        self.value.get("_class").and_then(Value::as_str)
    }

    /// Iterates the `_flags` entries that are strings.
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.value
            .get("_flags")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags().any(|f| f == flag)
    }

    /// True when `_flags` contains [`OP_FLAG`].
    pub fn is_op(&self) -> bool {
        self.has_flag(OP_FLAG)
    }

    /// The `_fields` object of the payload, if present.
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.value.get("_fields").and_then(Value::as_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_a_serde_cycle() {
        let raw = json!({
            "hash": "h1",
            "value": {"_class": "hhs/v0/Identity", "_flags": []},
            "dependencies": [
                {"hash": "k1", "path": "keyPair", "className": "hhs/v0/RSAKeyPair", "type": "literal", "direct": true}
            ],
            "author": "a1",
            "signature": "sig"
        });

        let literal: Literal = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(literal.hash.as_str(), "h1");
        assert_eq!(literal.dependencies[0].class_name, "hhs/v0/RSAKeyPair");
        assert_eq!(literal.extra["author"], json!("a1"));

        assert_eq!(serde_json::to_value(&literal).unwrap(), raw);
    }

    #[test]
    fn flags_and_class_are_read_from_the_payload() {
        let literal = Literal::new(
            "h2",
            json!({"_class": "hhs/v0/MutableSetAddOp", "_flags": ["op", "causal"]}),
        );
        assert_eq!(literal.class_name(), Some("hhs/v0/MutableSetAddOp"));
        assert!(literal.is_op());
        assert!(literal.has_flag("causal"));
        assert!(!literal.has_flag("undo"));
    }

    #[test]
    fn missing_flags_means_not_an_op() {
        let literal = Literal::new("h3", json!({"_class": "Plain"}));
        assert!(!literal.is_op());
        assert_eq!(literal.flags().count(), 0);
    }

    #[test]
    fn dependencies_default_to_empty() {
        let literal: Literal =
            serde_json::from_value(json!({"hash": "h4", "value": {"_class": "C"}})).unwrap();
        assert!(literal.dependencies.is_empty());
    }
}
