//! SQLite implementation of [`Backend`].
//!
//! [`SqliteBackend`] keeps one connection per instance. Every store runs in
//! a single `BEGIN IMMEDIATE` transaction covering the object log, the
//! secondary index, the op header and the causal frontier, so a literal is
//! either fully stored or not at all. Literal and header payloads are kept
//! as JSON TEXT via serde_json.
//!
//! File-backed instances attach to the shared [`FileMonitor`] for their
//! file; `":memory:"` instances are private and unmonitored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tokio::sync::Mutex;

use litstore_core::{Hash, Literal, LiteralKind, StoredOpHeader};

use crate::config::BackendConfig;
use crate::error::StorageError;
use crate::frontier::{self, TerminalOps};
use crate::index::{self, IndexKind, SearchParams, SearchResults};
use crate::monitor::{
    deliver, lock, Attachment, CallbackSlot, FileMonitor, MonitorRegistry, StoredObjectCallback,
};
use crate::retry::{crosses_interval, Backoff};
use crate::schema;
use crate::traits::{Backend, BackendFuture};

/// Filename requesting a private in-memory store.
pub const MEMORY: &str = ":memory:";

/// Value of [`Backend::backend_name`] for this backend.
pub const BACKEND_NAME: &str = "sqlite";

/// SQLite-backed implementation of [`Backend`].
pub struct SqliteBackend {
    name: String,
    conn: Mutex<Connection>,
    /// In-process write gate: at most one store transaction per instance.
    write_lock: Mutex<()>,
    callback: CallbackSlot,
    attachment: Option<Attachment>,
    config: BackendConfig,
    backoff: Backoff,
    closed: AtomicBool,
}

impl SqliteBackend {
    /// Opens `filename` with default configuration and the global monitor
    /// registry. `":memory:"` opens a private in-memory store.
    pub async fn open(filename: &str) -> Result<Self, StorageError> {
        Self::open_with_config(filename, BackendConfig::default()).await
    }

    pub async fn open_with_config(
        filename: &str,
        config: BackendConfig,
    ) -> Result<Self, StorageError> {
        Self::open_with_registry(filename, config, MonitorRegistry::global()).await
    }

    /// Opens `filename`, attaching to the monitor for that file in `registry`.
    pub async fn open_with_registry(
        filename: &str,
        config: BackendConfig,
        registry: &MonitorRegistry,
    ) -> Result<Self, StorageError> {
        let backoff = config.backoff();
        let callback: CallbackSlot = Arc::default();

        if filename == MEMORY {
            let conn = schema::open_in_memory(config.fast)?;
            return Ok(SqliteBackend {
                name: uuid::Uuid::new_v4().simple().to_string(),
                conn: Mutex::new(conn),
                write_lock: Mutex::new(()),
                callback,
                attachment: None,
                config,
                backoff,
                closed: AtomicBool::new(false),
            });
        }

        let attachment = registry
            .attach(filename, &config, Arc::clone(&callback))
            .await?;

        let opened = backoff
            .retry("open", filename, || {
                let opened = schema::open_database(filename, config.fast);
                async move { opened }
            })
            .await;

        let conn = match opened {
            Ok(conn) => conn,
            Err(err) => {
                attachment.detach().await;
                return Err(err);
            }
        };

        tracing::debug!(database = %filename, fast = config.fast, "opened SQLite backend");

        Ok(SqliteBackend {
            name: filename.to_string(),
            conn: Mutex::new(conn),
            write_lock: Mutex::new(()),
            callback,
            attachment: Some(attachment),
            config,
            backoff,
            closed: AtomicBool::new(false),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    /// The filename, or a random identifier for in-memory stores.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_memory(&self) -> bool {
        self.attachment.is_none()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn monitor(&self) -> Option<&FileMonitor> {
        self.attachment.as_ref().map(|a| a.monitor.as_ref())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persists `literal` (and, for operations, its header and frontier
    /// update) in one transaction, then notifies callbacks.
    ///
    /// Storing an existing hash is a no-op and notifies nobody, even when
    /// an operation is re-stored without its header.
    pub async fn store(
        &self,
        literal: Literal,
        op_header: Option<StoredOpHeader>,
    ) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed {
                database: self.name.clone(),
            });
        }

        let serialized = serde_json::to_string(&literal)?;
        let warn_interval = self.backoff.policy().warn_interval;

        let mut attempt = 0u32;
        let mut lock_waited = Duration::ZERO;

        let inserted = loop {
            let outcome = match self.write_lock.try_lock() {
                Ok(_write_guard) => {
                    let mut conn = self.conn.lock().await;
                    self.write_literal(&mut conn, &literal, &serialized, op_header.as_ref())
                }
                Err(_) => {
                    let delay = self.config.write_lock_retry_delay;
                    if crosses_interval(warn_interval, lock_waited, lock_waited + delay) {
                        tracing::warn!(
                            database = %self.name,
                            waited_ms = lock_waited.as_millis() as u64,
                            "store still waiting for the write lock"
                        );
                    }
                    lock_waited += delay;
                    self.backoff.clock().sleep(delay).await;
                    continue;
                }
            };

            match outcome {
                Ok(inserted) => break inserted,
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    self.backoff.wait("store", attempt, &self.name).await?;
                }
                Err(err) => {
                    tracing::error!(database = %self.name, hash = %literal.hash, error = %err, "SQLite store error");
                    return Err(err);
                }
            }
        };

        if inserted {
            match &self.attachment {
                Some(attachment) => attachment.monitor.notify_all(literal).await,
                None => deliver(&self.callback, literal).await,
            }
        }

        Ok(())
    }

    /// One store attempt. Returns `false` if the hash was already stored.
    fn write_literal(
        &self,
        conn: &mut Connection,
        literal: &Literal,
        serialized: &str,
        op_header: Option<&StoredOpHeader>,
    ) -> Result<bool, StorageError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM objects WHERE hash = ?1)",
            params![literal.hash.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            tx.commit()?;
            return Ok(false);
        }

        // Only new literals are classified; a missing header on a re-store is fine.
        let kind = LiteralKind::classify(literal, op_header)?;

        if let Some(monitor) = self.monitor() {
            monitor.mark_self_written(&literal.hash);
        }

        // Dropping `tx` on the error path rolls the transaction back.
        let result = match Self::insert_literal(&tx, literal, serialized, &kind) {
            Ok(()) => tx.commit().map_err(StorageError::from),
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Some(monitor) = self.monitor() {
                monitor.clear_self_written(&literal.hash);
            }
        }

        result.map(|()| true)
    }

    fn insert_literal(
        tx: &Transaction<'_>,
        literal: &Literal,
        serialized: &str,
        kind: &LiteralKind<'_>,
    ) -> Result<(), StorageError> {
        let hash = &literal.hash;

        tx.execute(
            "INSERT INTO objects (hash, literal, timestamp) VALUES (?1, ?2, ?3)",
            params![hash.as_str(), serialized, chrono::Utc::now().timestamp_millis()],
        )?;

        // classify() guarantees a class name.
        let class_name = literal.class_name().unwrap_or_default();
        index::insert_keys(tx, hash, &index::derive_keys(literal, class_name))?;

        if let LiteralKind::Operation(op) = kind {
            tx.execute(
                "INSERT INTO op_headers (header_hash, op_hash, literal) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(header_hash) DO UPDATE SET op_hash = excluded.op_hash, literal = excluded.literal",
                params![
                    op.header.header_hash().as_str(),
                    hash.as_str(),
                    serde_json::to_string(&op.header.literal)?,
                ],
            )?;

            frontier::apply_operation(tx, &op.target, &op.prev_ops, hash)?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    async fn read<T, F>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: Fn(&Connection) -> Result<T, StorageError> + Sync,
    {
        self.backoff
            .with_connection(&self.conn, operation, &self.name, f)
            .await
    }

    pub async fn load(&self, hash: &Hash) -> Result<Option<Literal>, StorageError> {
        self.read("load", |conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT literal FROM objects WHERE hash = ?1",
                    params![hash.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row.map(|json| serde_json::from_str(&json)).transpose()?)
        })
        .await
    }

    /// Header of the operation `op_hash`.
    pub async fn load_op_header(
        &self,
        op_hash: &Hash,
    ) -> Result<Option<StoredOpHeader>, StorageError> {
        self.read("load op header", |conn| {
            load_header(
                conn,
                "SELECT literal FROM op_headers WHERE op_hash = ?1 LIMIT 1",
                op_hash,
            )
        })
        .await
    }

    pub async fn load_op_header_by_header_hash(
        &self,
        header_hash: &Hash,
    ) -> Result<Option<StoredOpHeader>, StorageError> {
        self.read("load op header by header hash", |conn| {
            load_header(
                conn,
                "SELECT literal FROM op_headers WHERE header_hash = ?1",
                header_hash,
            )
        })
        .await
    }

    pub async fn load_terminal_ops_for_mutable(
        &self,
        mutable: &Hash,
    ) -> Result<Option<TerminalOps>, StorageError> {
        self.read("load terminal ops", |conn| frontier::load(conn, mutable))
            .await
    }

    pub async fn search_by_class(
        &self,
        class_name: &str,
        params: &SearchParams,
    ) -> Result<SearchResults, StorageError> {
        self.search_by_key(IndexKind::Class.key(class_name), params)
            .await
    }

    pub async fn search_by_reference(
        &self,
        referring_path: &str,
        referenced_hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, StorageError> {
        let value = index::reference_value(referring_path, referenced_hash);
        self.search_by_key(IndexKind::References.key(&value), params)
            .await
    }

    pub async fn search_by_referencing_class(
        &self,
        referring_class: &str,
        referring_path: &str,
        referenced_hash: &Hash,
        params: &SearchParams,
    ) -> Result<SearchResults, StorageError> {
        let value =
            index::referencing_class_value(referring_class, referring_path, referenced_hash);
        self.search_by_key(IndexKind::ReferencingClass.key(&value), params)
            .await
    }

    async fn search_by_key(
        &self,
        key: String,
        params: &SearchParams,
    ) -> Result<SearchResults, StorageError> {
        self.read("search", |conn| index::search(conn, &key, params))
            .await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn set_stored_object_callback(&self, callback: StoredObjectCallback) {
        *lock(&self.callback) = Some(callback);
    }

    /// Confirms the schema is present.
    pub async fn ready(&self) -> Result<(), StorageError> {
        let present = self.read("ready", schema::present_tables).await?;
        if present != schema::TABLES.len() {
            return Err(StorageError::Migration(format!(
                "expected {} tables, found {present}",
                schema::TABLES.len()
            )));
        }
        Ok(())
    }

    /// Detaches from the shared-file monitor, tearing it down if this was
    /// the last instance on the file. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(attachment) = &self.attachment {
            attachment.detach().await;
        }
    }
}

fn load_header(
    conn: &Connection,
    sql: &str,
    key: &Hash,
) -> Result<Option<StoredOpHeader>, StorageError> {
    let row: Option<String> = conn
        .query_row(sql, params![key.as_str()], |row| row.get(0))
        .optional()?;
    match row {
        Some(json) => Ok(Some(StoredOpHeader {
            literal: serde_json::from_str(&json)?,
        })),
        None => Ok(None),
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(attachment) = self.attachment.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { attachment.detach().await });
            }
            Err(_) => {
                tracing::warn!(database = %self.name, "backend dropped outside a runtime without close()");
            }
        }
    }
}

impl Backend for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn store<'a>(
        &'a self,
        literal: Literal,
        op_header: Option<StoredOpHeader>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(SqliteBackend::store(self, literal, op_header))
    }

    fn load<'a>(&'a self, hash: &'a Hash) -> BackendFuture<'a, Option<Literal>> {
        Box::pin(SqliteBackend::load(self, hash))
    }

    fn load_op_header<'a>(&'a self, op_hash: &'a Hash) -> BackendFuture<'a, Option<StoredOpHeader>> {
        Box::pin(SqliteBackend::load_op_header(self, op_hash))
    }

    fn load_op_header_by_header_hash<'a>(
        &'a self,
        header_hash: &'a Hash,
    ) -> BackendFuture<'a, Option<StoredOpHeader>> {
        Box::pin(SqliteBackend::load_op_header_by_header_hash(self, header_hash))
    }

    fn load_terminal_ops_for_mutable<'a>(
        &'a self,
        mutable: &'a Hash,
    ) -> BackendFuture<'a, Option<TerminalOps>> {
        Box::pin(SqliteBackend::load_terminal_ops_for_mutable(self, mutable))
    }

    fn search_by_class<'a>(
        &'a self,
        class_name: &'a str,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults> {
        Box::pin(SqliteBackend::search_by_class(self, class_name, params))
    }

    fn search_by_reference<'a>(
        &'a self,
        referring_path: &'a str,
        referenced_hash: &'a Hash,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults> {
        Box::pin(SqliteBackend::search_by_reference(
            self,
            referring_path,
            referenced_hash,
            params,
        ))
    }

    fn search_by_referencing_class<'a>(
        &'a self,
        referring_class: &'a str,
        referring_path: &'a str,
        referenced_hash: &'a Hash,
        params: &'a SearchParams,
    ) -> BackendFuture<'a, SearchResults> {
        Box::pin(SqliteBackend::search_by_referencing_class(
            self,
            referring_class,
            referring_path,
            referenced_hash,
            params,
        ))
    }

    fn set_stored_object_callback(&self, callback: StoredObjectCallback) {
        SqliteBackend::set_stored_object_callback(self, callback)
    }

    fn ready<'a>(&'a self) -> BackendFuture<'a, ()> {
        Box::pin(SqliteBackend::ready(self))
    }

    fn close<'a>(&'a self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(SqliteBackend::close(self))
    }
}
