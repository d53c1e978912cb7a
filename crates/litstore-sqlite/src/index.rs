//! Secondary index over stored literals.
//!
//! Every literal gets one `class` key plus, per dependency, one
//! `references` and one `referencing-class` key. Keys are stored as
//! `"<kind>_<value>"` in `object_lookup` and joined back to `objects` to
//! order results by sequence.
//!
//! Entries are append-only. If a hash were ever re-stored with different
//! derived values the first set of keys would not be retracted; since a
//! re-store of an existing hash writes nothing, this cannot happen through
//! the backend itself.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde::{Deserialize, Serialize};

use litstore_core::{Hash, Literal};

use crate::error::StorageError;

/// The three families of index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Class,
    References,
    ReferencingClass,
}

impl IndexKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IndexKind::Class => "class",
            IndexKind::References => "references",
            IndexKind::ReferencingClass => "referencing-class",
        }
    }

    /// Composes the stored key for `value`.
    pub fn key(self, value: &str) -> String {
        format!("{}_{}", self.prefix(), value)
    }
}

/// Value of a `references` key: `path#hash`.
pub fn reference_value(path: &str, hash: &Hash) -> String {
    format!("{path}#{hash}")
}

/// Value of a `referencing-class` key: `className.path#hash`.
pub fn referencing_class_value(class_name: &str, path: &str, hash: &Hash) -> String {
    format!("{class_name}.{path}#{hash}")
}

/// All keys to insert for `literal`: `1 + 2 * dependencies`.
pub fn derive_keys(literal: &Literal, class_name: &str) -> Vec<String> {
    let mut keys = Vec::with_capacity(1 + 2 * literal.dependencies.len());
    keys.push(IndexKind::Class.key(class_name));
    for dep in &literal.dependencies {
        keys.push(IndexKind::References.key(&reference_value(&dep.path, &dep.hash)));
        keys.push(
            IndexKind::ReferencingClass
                .key(&referencing_class_value(&dep.class_name, &dep.path, &dep.hash)),
        );
    }
    keys
}

pub(crate) fn insert_keys(
    tx: &Transaction<'_>,
    hash: &Hash,
    keys: &[String],
) -> Result<(), StorageError> {
    let mut stmt = tx.prepare_cached("INSERT INTO object_lookup (key, hash) VALUES (?1, ?2)")?;
    for key in keys {
        stmt.execute(params![key, hash.as_str()])?;
    }
    Ok(())
}

/// Result ordering by sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchOrder {
    #[default]
    Asc,
    Desc,
}

impl SearchOrder {
    fn sql(self) -> &'static str {
        match self {
            SearchOrder::Asc => "ASC",
            SearchOrder::Desc => "DESC",
        }
    }
}

/// Paging parameters for index searches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub order: SearchOrder,
    /// Exclusive cursor: the `end` of a previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl SearchParams {
    pub fn asc() -> Self {
        SearchParams::default()
    }

    pub fn desc() -> Self {
        SearchParams {
            order: SearchOrder::Desc,
            ..SearchParams::default()
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }
}

/// A page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub items: Vec<Literal>,
    /// Sequence of the first item, as a string cursor.
    pub start: Option<String>,
    /// Sequence of the last item; pass as the next page's `start`.
    pub end: Option<String>,
}

/// Runs the paged index query for an exact `key`.
pub(crate) fn search(
    conn: &Connection,
    key: &str,
    params: &SearchParams,
) -> Result<SearchResults, StorageError> {
    let mut sql = String::from(
        "SELECT objects.literal, objects.sequence FROM objects \
         INNER JOIN object_lookup ON objects.hash = object_lookup.hash \
         WHERE object_lookup.key = ?",
    );
    let mut values = vec![SqlValue::Text(key.to_string())];

    if let Some(start) = &params.start {
        let cursor: i64 = start
            .trim()
            .parse()
            .map_err(|_| StorageError::InvalidCursor(start.clone()))?;
        sql.push_str(match params.order {
            SearchOrder::Asc => " AND objects.sequence > ?",
            SearchOrder::Desc => " AND objects.sequence < ?",
        });
        values.push(SqlValue::Integer(cursor));
    }

    sql.push_str(" ORDER BY objects.sequence ");
    sql.push_str(params.order.sql());

    if let Some(limit) = params.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(i64::from(limit)));
    }

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        let literal: String = row.get(0)?;
        let sequence: i64 = row.get(1)?;
        Ok((literal, sequence))
    })?;

    let mut results = SearchResults::default();
    for row in rows {
        let (literal, sequence) = row?;
        results.items.push(serde_json::from_str(&literal)?);
        if results.start.is_none() {
            results.start = Some(sequence.to_string());
        }
        results.end = Some(sequence.to_string());
    }
    Ok(results)
}
