//! SQL schema and connection setup for the SQLite backend.
//!
//! Uses `rusqlite_migration` to apply the schema via SQLite's
//! `user_version` pragma. The migration itself only uses
//! `CREATE ... IF NOT EXISTS`, so opening a file created by an older
//! process is a no-op.

use std::time::Duration;

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::StorageError;

/// Tables the backend relies on.
pub const TABLES: [&str; 4] = ["objects", "object_lookup", "terminal_ops", "op_headers"];

/// All schema migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial_schema.sql"))])
}

/// Opens (or creates) the database at `path` and applies the schema.
///
/// A busy/locked error is returned as-is; callers retry the whole open.
pub fn open_database(path: &str, fast: bool) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    configure_and_migrate(&mut conn, fast)?;
    Ok(conn)
}

/// Opens a private in-memory database with the schema applied.
pub fn open_in_memory(fast: bool) -> Result<Connection, StorageError> {
    let mut conn = Connection::open_in_memory()?;
    configure_and_migrate(&mut conn, fast)?;
    Ok(conn)
}

fn configure_and_migrate(conn: &mut Connection, fast: bool) -> Result<(), StorageError> {
    // Contention must surface as SQLITE_BUSY so the retry policy handles it.
    conn.busy_timeout(Duration::ZERO)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    if fast {
        conn.pragma_update(None, "read_uncommitted", true)?;
        conn.pragma_update(None, "synchronous", "OFF")?;
    } else {
        conn.pragma_update(None, "synchronous", "FULL")?;
    }

    migrations().to_latest(conn)?;

    Ok(())
}

/// Counts how many of [`TABLES`] exist in the connected database.
pub fn present_tables(conn: &Connection) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (?1, ?2, ?3, ?4)",
    )?;
    let count: i64 = stmt.query_row(rusqlite::params_from_iter(TABLES), |row| row.get(0))?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        migrations().validate().unwrap();
    }

    #[test]
    fn in_memory_database_has_all_tables() {
        let conn = open_in_memory(false).unwrap();
        assert_eq!(present_tables(&conn).unwrap(), TABLES.len());
    }

    #[test]
    fn reopening_an_existing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        {
            let conn = open_database(path, false).unwrap();
            conn.execute(
                "INSERT INTO objects (hash, literal, timestamp) VALUES ('h', '{}', 0)",
                [],
            )
            .unwrap();
        }

        let conn = open_database(path, true).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(present_tables(&conn).unwrap(), TABLES.len());
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let conn = open_database(path.to_str().unwrap(), false).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
