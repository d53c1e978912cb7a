//! Shared-file change monitor.
//!
//! Every backend opened on the same file (through the same
//! [`MonitorRegistry`]) shares one [`FileMonitor`]. The monitor owns its own
//! connection and a polling task that picks up rows committed by anyone,
//! including other processes, and fans them out to the callbacks of all
//! attached backends.
//!
//! Writes made through an attached backend are marked as "self-written"
//! before they commit. The writer notifies the callbacks itself; when the
//! poller later reaches that row it only clears the mark.
//!
//! The monitor lives exactly as long as at least one backend is attached:
//! the first [`MonitorRegistry::attach`] creates it and the last
//! [`MonitorRegistry::detach`] stops the task and closes the connection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use litstore_core::{Hash, Literal};

use crate::config::BackendConfig;
use crate::error::StorageError;
use crate::retry::Backoff;
use crate::schema;

/// Boxed future returned by a [`StoredObjectCallback`].
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked once for every literal that becomes durable.
pub type StoredObjectCallback = Arc<dyn Fn(Literal) -> CallbackFuture + Send + Sync>;

/// Wraps an async closure as a [`StoredObjectCallback`].
pub fn stored_object_callback<F, Fut>(f: F) -> StoredObjectCallback
where
    F: Fn(Literal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |literal| Box::pin(f(literal)))
}

/// Callback slot owned by one backend instance.
pub(crate) type CallbackSlot = Arc<StdMutex<Option<StoredObjectCallback>>>;

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invokes the callback in `slot`, if one is set.
pub(crate) async fn deliver(slot: &CallbackSlot, literal: Literal) {
    let callback = lock(slot).clone();
    if let Some(callback) = callback {
        callback(literal).await;
    }
}

struct LogRow {
    sequence: i64,
    hash: Hash,
    literal: String,
}

/// Poller and fan-out point for one storage file.
pub struct FileMonitor {
    filename: String,
    /// `None` once the monitor has been shut down.
    conn: Mutex<Option<Connection>>,
    /// Highest sequence already handled.
    delivered_seq: StdMutex<Option<i64>>,
    self_written: StdMutex<HashSet<Hash>>,
    subscribers: StdMutex<BTreeMap<u64, CallbackSlot>>,
    /// Held for the duration of a poll; a tick that cannot take it is skipped.
    tick_guard: Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl FileMonitor {
    async fn start(filename: &str, config: &BackendConfig) -> Result<Arc<Self>, StorageError> {
        let backoff: Backoff = config.backoff();

        let conn = backoff
            .retry("open monitor", filename, || {
                let opened = schema::open_database(filename, config.fast);
                async move { opened }
            })
            .await?;

        let max_seq = backoff
            .retry("max sequence lookup", filename, || {
                let max = max_sequence(&conn);
                async move { max }
            })
            .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        let monitor = Arc::new(FileMonitor {
            filename: filename.to_string(),
            conn: Mutex::new(Some(conn)),
            delivered_seq: StdMutex::new(max_seq),
            self_written: StdMutex::new(HashSet::new()),
            subscribers: StdMutex::new(BTreeMap::new()),
            tick_guard: Mutex::new(()),
            shutdown,
            task: StdMutex::new(None),
        });

        let handle = tokio::spawn(Self::run(
            Arc::clone(&monitor),
            config.poll_interval,
            shutdown_rx,
        ));
        *lock(&monitor.task) = Some(handle);

        tracing::debug!(database = %filename, ?max_seq, "started shared-file monitor");
        Ok(monitor)
    }

    async fn run(monitor: Arc<FileMonitor>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = monitor.poll().await {
                        tracing::error!(database = %monitor.filename, error = %err, "monitor poll failed");
                    }
                }
            }
        }

        monitor.close_connection().await;
        tracing::debug!(database = %monitor.filename, "shared-file monitor stopped");
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Highest sequence number already handled.
    pub fn delivered_sequence(&self) -> Option<i64> {
        *lock(&self.delivered_seq)
    }

    /// Number of writes marked as delivered by their writer but not yet
    /// reached by the poller.
    pub fn pending_self_writes(&self) -> usize {
        lock(&self.self_written).len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub(crate) fn mark_self_written(&self, hash: &Hash) {
        lock(&self.self_written).insert(hash.clone());
    }

    pub(crate) fn clear_self_written(&self, hash: &Hash) {
        lock(&self.self_written).remove(hash);
    }

    /// Delivers `literal` to every attached backend's callback.
    pub(crate) async fn notify_all(&self, literal: Literal) {
        let slots: Vec<CallbackSlot> = lock(&self.subscribers).values().cloned().collect();
        for slot in slots {
            deliver(&slot, literal.clone()).await;
        }
    }

    /// One polling pass. Returns how many literals were delivered.
    pub(crate) async fn poll(&self) -> Result<usize, StorageError> {
        let Ok(_tick) = self.tick_guard.try_lock() else {
            return Ok(0);
        };

        let mark = self.delivered_sequence();

        let rows = {
            let conn = self.conn.lock().await;
            let Some(conn) = conn.as_ref() else {
                return Ok(0);
            };
            match rows_after(conn, mark) {
                Ok(rows) => rows,
                // Contended; the next tick picks these rows up.
                Err(err) if err.is_transient() => return Ok(0),
                Err(err) => return Err(err),
            }
        };

        let mut delivered = 0;
        for row in rows {
            let self_written = lock(&self.self_written).remove(&row.hash);
            if !self_written {
                match serde_json::from_str::<Literal>(&row.literal) {
                    Ok(literal) => {
                        tracing::debug!(database = %self.filename, hash = %row.hash, sequence = row.sequence, "delivering stored literal");
                        self.notify_all(literal).await;
                        delivered += 1;
                    }
                    Err(err) => {
                        tracing::error!(database = %self.filename, hash = %row.hash, error = %err, "skipping undecodable literal");
                    }
                }
            }
            *lock(&self.delivered_seq) = Some(row.sequence);
        }

        Ok(delivered)
    }

    /// Stops the polling task and releases the connection.
    ///
    /// When called from a callback running on the polling task itself, the
    /// task is only signalled; it closes the connection once the current
    /// tick returns.
    async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if tokio::task::try_id() == Some(task.id()) {
                return;
            }
            if let Err(err) = task.await {
                tracing::warn!(database = %self.filename, error = %err, "monitor task ended abnormally");
            }
        }

        self.close_connection().await;
    }

    /// True once the monitor's connection has been released.
    pub async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_none()
    }

    async fn close_connection(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err((_, err)) = conn.close() {
                tracing::warn!(database = %self.filename, error = %err, "failed to close monitor connection");
            }
        }
    }
}

fn max_sequence(conn: &Connection) -> Result<Option<i64>, StorageError> {
    Ok(conn.query_row("SELECT MAX(sequence) FROM objects", [], |row| row.get(0))?)
}

fn rows_after(conn: &Connection, mark: Option<i64>) -> Result<Vec<LogRow>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence, hash, literal FROM objects WHERE sequence > ?1 ORDER BY sequence ASC",
    )?;
    let rows = stmt.query_map(params![mark.unwrap_or(0)], |row| {
        Ok(LogRow {
            sequence: row.get(0)?,
            hash: Hash(row.get(1)?),
            literal: row.get(2)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// A backend's membership in a [`FileMonitor`].
pub(crate) struct Attachment {
    pub(crate) registry: MonitorRegistry,
    pub(crate) id: u64,
    pub(crate) monitor: Arc<FileMonitor>,
}

impl Attachment {
    pub(crate) async fn detach(&self) {
        self.registry.detach(self.monitor.filename(), self.id).await;
    }
}

/// Process-level map from storage file to its [`FileMonitor`].
///
/// Cloning is cheap and clones share the same map. Backends opened through
/// different registries on the same file behave like separate processes.
#[derive(Clone, Default)]
pub struct MonitorRegistry {
    monitors: Arc<Mutex<HashMap<String, Arc<FileMonitor>>>>,
    next_id: Arc<AtomicU64>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        MonitorRegistry::default()
    }

    /// The registry used by [`SqliteBackend::open`](crate::SqliteBackend::open).
    pub fn global() -> &'static MonitorRegistry {
        static GLOBAL: OnceLock<MonitorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MonitorRegistry::new)
    }

    /// Attaches a callback slot to the monitor for `filename`, creating the
    /// monitor on first use.
    pub(crate) async fn attach(
        &self,
        filename: &str,
        config: &BackendConfig,
        slot: CallbackSlot,
    ) -> Result<Attachment, StorageError> {
        let mut monitors = self.monitors.lock().await;

        let monitor = match monitors.get(filename) {
            Some(monitor) => Arc::clone(monitor),
            None => {
                let monitor = FileMonitor::start(filename, config).await?;
                monitors.insert(filename.to_string(), Arc::clone(&monitor));
                monitor
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&monitor.subscribers).insert(id, slot);

        Ok(Attachment {
            registry: self.clone(),
            id,
            monitor,
        })
    }

    /// Detaches subscriber `id`; the last detach tears the monitor down.
    pub(crate) async fn detach(&self, filename: &str, id: u64) {
        let retired = {
            let mut monitors = self.monitors.lock().await;
            let Some(monitor) = monitors.get(filename).cloned() else {
                return;
            };
            let remaining = {
                let mut subscribers = lock(&monitor.subscribers);
                subscribers.remove(&id);
                subscribers.len()
            };
            if remaining > 0 {
                return;
            }
            monitors.remove(filename);
            monitor
        };

        retired.stop().await;
        tracing::debug!(database = %filename, "released shared-file monitor");
    }

    /// The monitor currently serving `filename`, if any.
    pub async fn monitor_for(&self, filename: &str) -> Option<Arc<FileMonitor>> {
        self.monitors.lock().await.get(filename).cloned()
    }

    /// Files that currently have a live monitor.
    pub async fn monitored_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.monitors.lock().await.keys().cloned().collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_slot(counter: Arc<AtomicUsize>) -> CallbackSlot {
        Arc::new(StdMutex::new(Some(stored_object_callback(move |_literal| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))))
    }

    fn insert_row(path: &str, hash: &str) {
        let conn = schema::open_database(path, false).unwrap();
        let literal = Literal::new(hash, serde_json::json!({"_class": "C", "_flags": []}));
        conn.execute(
            "INSERT INTO objects (hash, literal, timestamp) VALUES (?1, ?2, 0)",
            params![hash, serde_json::to_string(&literal).unwrap()],
        )
        .unwrap();
    }

    fn slow_config() -> BackendConfig {
        // Long period so only explicit polls run during the test.
        BackendConfig::default().with_poll_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn mark_starts_at_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let path = path.to_str().unwrap();
        insert_row(path, "old");

        let registry = MonitorRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let attachment = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&counter)))
            .await
            .unwrap();

        assert_eq!(attachment.monitor.delivered_sequence(), Some(1));
        assert_eq!(attachment.monitor.poll().await.unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        attachment.detach().await;
    }

    #[tokio::test]
    async fn new_rows_reach_every_subscriber_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let path = path.to_str().unwrap();

        let registry = MonitorRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let a = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&first)))
            .await
            .unwrap();
        let b = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&second)))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a.monitor, &b.monitor));

        insert_row(path, "fresh");

        assert_eq!(a.monitor.poll().await.unwrap(), 1);
        assert_eq!(a.monitor.poll().await.unwrap(), 0);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn self_written_rows_only_advance_the_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let path = path.to_str().unwrap();

        let registry = MonitorRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let attachment = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&counter)))
            .await
            .unwrap();

        attachment.monitor.mark_self_written(&Hash::from("mine"));
        insert_row(path, "mine");

        assert_eq!(attachment.monitor.poll().await.unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(attachment.monitor.pending_self_writes(), 0);
        assert_eq!(attachment.monitor.delivered_sequence(), Some(1));

        attachment.detach().await;
    }

    #[tokio::test]
    async fn contended_tick_is_skipped_and_picked_up_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let path = path.to_str().unwrap();

        let registry = MonitorRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let attachment = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&counter)))
            .await
            .unwrap();

        // Rollback-journal file: an exclusive writer locks readers out.
        let locked = dir.path().join("locked.db");
        let writer = Connection::open(&locked).unwrap();
        writer
            .execute_batch(
                "CREATE TABLE objects (sequence INTEGER PRIMARY KEY AUTOINCREMENT, \
                 hash TEXT NOT NULL, literal TEXT NOT NULL, timestamp INTEGER NOT NULL);",
            )
            .unwrap();
        let reader = Connection::open(&locked).unwrap();
        reader.busy_timeout(Duration::ZERO).unwrap();
        let original = attachment.monitor.conn.lock().await.replace(reader);

        let literal = Literal::new("x", serde_json::json!({"_class": "C", "_flags": []}));
        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();
        writer
            .execute(
                "INSERT INTO objects (hash, literal, timestamp) VALUES ('x', ?1, 0)",
                params![serde_json::to_string(&literal).unwrap()],
            )
            .unwrap();

        assert_eq!(attachment.monitor.poll().await.unwrap(), 0);
        assert_eq!(attachment.monitor.delivered_sequence(), None);

        writer.execute_batch("COMMIT").unwrap();

        assert_eq!(attachment.monitor.poll().await.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(attachment.monitor.delivered_sequence(), Some(1));

        *attachment.monitor.conn.lock().await = original;
        attachment.detach().await;
    }

    #[tokio::test]
    async fn last_detach_releases_the_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let path = path.to_str().unwrap();

        let registry = MonitorRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&counter)))
            .await
            .unwrap();
        let b = registry
            .attach(path, &slow_config(), counting_slot(Arc::clone(&counter)))
            .await
            .unwrap();

        a.detach().await;
        assert_eq!(registry.monitored_files().await, vec![path.to_string()]);
        assert_eq!(b.monitor.subscriber_count(), 1);

        b.detach().await;
        assert!(registry.monitored_files().await.is_empty());
        assert!(b.monitor.is_closed().await);
        assert_eq!(b.monitor.poll().await.unwrap(), 0);
    }
}
