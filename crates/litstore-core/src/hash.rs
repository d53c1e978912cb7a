//! Content hash identifier for literals and headers.
//!
//! The storage layer never computes hashes, it only compares and persists
//! them, so [`Hash`] is an opaque string newtype.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque content hash. Serializes as a bare JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub String);

impl Hash {
    pub fn new(value: impl Into<String>) -> Self {
        Hash(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hash {
    fn from(value: &str) -> Self {
        Hash(value.to_string())
    }
}

impl From<String> for Hash {
    fn from(value: String) -> Self {
        Hash(value)
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Hash {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_serializes_as_plain_string() {
        let hash = Hash::new("abc123");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"abc123\"");

        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn hash_can_be_looked_up_by_str() {
        let mut set = std::collections::HashSet::new();
        set.insert(Hash::from("h1"));
        assert!(set.contains("h1"));
        assert!(!set.contains("h2"));
    }
}
