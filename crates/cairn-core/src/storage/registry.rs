//! Database registry
//!
//! Maps logical database names to their configuration and to a lazily opened
//! in-memory SQLite handle. The handle is loaded from the snapshot file on
//! first use and written back by the persistence scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::backup::Progress;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, DatabaseName, Row};
use tracing::{debug, info, warn};

use super::batch::BatchOperation;
use super::error::{StorageError, StorageResult};
use super::persistence::Timers;
use crate::config::StorageSettings;
use crate::constants;

/// Registration-time configuration of a named database
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Unique key in the registry
    pub name: String,
    /// Snapshot file the handle is loaded from and saved to
    pub file_path: PathBuf,
    pub auto_save_enabled: bool,
    pub auto_save_interval: Duration,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Config with autosave on at the default interval
    pub fn new(name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            auto_save_enabled: true,
            auto_save_interval: constants::storage::AUTOSAVE_INTERVAL,
            max_connections: constants::storage::MAX_CONNECTIONS,
        }
    }

    pub fn with_autosave(mut self, enabled: bool) -> Self {
        self.auto_save_enabled = enabled;
        self
    }

    pub fn with_autosave_interval(mut self, interval: Duration) -> Self {
        self.auto_save_interval = interval;
        self
    }
}

/// An open in-memory database, shared between the registry and its callers
#[derive(Clone)]
pub struct DatabaseHandle {
    name: Arc<str>,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Open an in-memory database, restoring it from `path` if the file exists
    ///
    /// An unreadable snapshot is logged and replaced by an empty database.
    pub(crate) fn load(name: &str, path: &Path) -> StorageResult<Self> {
        let mut conn = Connection::open_in_memory()?;

        if path.exists() {
            match conn.restore(DatabaseName::Main, path, None::<fn(Progress)>) {
                Ok(()) => {
                    info!(database = %name, path = %path.display(), "Loaded snapshot");
                }
                Err(source) => {
                    let err = StorageError::LoadCorrupted {
                        name: name.to_string(),
                        source,
                    };
                    warn!(database = %name, "{}; starting empty", err);
                    conn = Connection::open_in_memory()?;
                }
            }
        } else {
            debug!(database = %name, path = %path.display(), "No snapshot, starting empty");
        }

        Ok(Self {
            name: Arc::from(name),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a closure against the connection
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure that needs exclusive access (transactions)
    pub(crate) fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> T) -> T {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

/// Per-name registry entry
pub(super) struct DatabaseEntry {
    pub(super) config: DatabaseConfig,
    pub(super) handle: Option<DatabaseHandle>,
    pub(super) queue: Vec<BatchOperation>,
    pub(super) timers: Timers,
    /// Single-flight guard: at most one snapshot write per database at a time
    pub(super) save_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
pub(super) struct Registry {
    pub(super) entries: HashMap<String, DatabaseEntry>,
    /// Registration order, used by the drain sequence
    pub(super) order: Vec<String>,
}

pub(super) struct ManagerInner {
    pub(super) batch_threshold: usize,
    pub(super) save_debounce: Duration,
    pub(super) registry: Mutex<Registry>,
}

/// Owner of every named database in the process
///
/// Cheap to clone; clones share the same registry. Construct one at the
/// application's composition root and call [`DatabaseManager::shutdown`]
/// before exit.
#[derive(Clone)]
pub struct DatabaseManager {
    pub(super) inner: Arc<ManagerInner>,
}

impl DatabaseManager {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                batch_threshold: settings.batch_threshold.max(1),
                save_debounce: settings.save_debounce(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Register a database
    ///
    /// Idempotent: a second call with an already registered name changes
    /// nothing, even if the config differs.
    pub fn register(&self, config: DatabaseConfig) -> StorageResult<()> {
        let name = config.name.clone();
        let autosave = config
            .auto_save_enabled
            .then_some(config.auto_save_interval);

        {
            let mut registry = self.inner.registry.lock();
            if registry.entries.contains_key(&name) {
                debug!(database = %name, "Already registered");
                return Ok(());
            }

            if let Some(parent) = config.file_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            info!(
                database = %name,
                path = %config.file_path.display(),
                autosave = config.auto_save_enabled,
                "Registered database"
            );
            registry.order.push(name.clone());
            registry.entries.insert(
                name.clone(),
                DatabaseEntry {
                    config,
                    handle: None,
                    queue: Vec::new(),
                    timers: Timers::default(),
                    save_lock: Arc::new(tokio::sync::Mutex::new(())),
                },
            );
        }

        if let Some(interval) = autosave {
            self.start_autosave(&name, interval);
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.registry.lock().entries.contains_key(name)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.inner
            .registry
            .lock()
            .entries
            .get(name)
            .is_some_and(|e| e.handle.is_some())
    }

    pub fn config(&self, name: &str) -> Option<DatabaseConfig> {
        self.inner
            .registry
            .lock()
            .entries
            .get(name)
            .map(|e| e.config.clone())
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.inner.registry.lock().order.clone()
    }

    /// The open handle for `name`, if any, without loading
    pub(super) fn open_handle(&self, name: &str) -> Option<DatabaseHandle> {
        self.inner
            .registry
            .lock()
            .entries
            .get(name)
            .and_then(|e| e.handle.clone())
    }

    /// Get the handle for `name`, loading it from disk on first use
    pub async fn handle(&self, name: &str) -> StorageResult<DatabaseHandle> {
        let path = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get(name)
                .ok_or_else(|| StorageError::NotRegistered(name.to_string()))?;
            if let Some(handle) = &entry.handle {
                return Ok(handle.clone());
            }
            entry.config.file_path.clone()
        };

        let owned = name.to_string();
        let loaded = tokio::task::spawn_blocking(move || DatabaseHandle::load(&owned, &path))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        let (handle, restart_autosave) = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| StorageError::NotRegistered(name.to_string()))?;
            match &entry.handle {
                // Another caller finished loading first; keep theirs
                Some(existing) => (existing.clone(), None),
                None => {
                    entry.handle = Some(loaded.clone());
                    let restart = (entry.config.auto_save_enabled && !entry.timers.autosave_running)
                        .then_some(entry.config.auto_save_interval);
                    (loaded, restart)
                }
            }
        };

        if let Some(interval) = restart_autosave {
            self.start_autosave(name, interval);
        }
        Ok(handle)
    }

    /// Execute a single statement immediately, outside the batch queue
    pub async fn execute(&self, name: &str, sql: &str, params: Vec<Value>) -> StorageResult<usize> {
        let handle = self.handle(name).await?;
        let changed = handle.with_conn(|conn| conn.execute(sql, params_from_iter(params.iter())))?;
        self.request_save(name);
        Ok(changed)
    }

    /// Run a read query and decode each row with `map`
    pub async fn query<T, F>(
        &self,
        name: &str,
        sql: &str,
        params: Vec<Value>,
        map: F,
    ) -> StorageResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let handle = self.handle(name).await?;
        let rows = handle.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), map)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows)
    }

    /// Like [`DatabaseManager::query`] but returns only the first row
    pub async fn query_one<T, F>(
        &self,
        name: &str,
        sql: &str,
        params: Vec<Value>,
        map: F,
    ) -> StorageResult<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.query(name, sql, params, map).await?.into_iter().next())
    }

    /// Close the handle for `name`
    ///
    /// Cancels timers, flushes the queue, saves immediately and drops the
    /// handle. Queued writes are drained even if the handle was never opened.
    /// The registration survives, so a later [`DatabaseManager::handle`]
    /// reopens from the snapshot. Closing a name with no handle and no queued
    /// writes only stops its timers.
    pub async fn close(&self, name: &str) -> StorageResult<()> {
        {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| StorageError::NotRegistered(name.to_string()))?;
            // Timers spawned from here on observe the cancelled token and exit at once
            entry.timers.cancel();
            if entry.handle.is_none() && entry.queue.is_empty() {
                entry.timers = Timers::default();
                return Ok(());
            }
        }

        let flushed = self.flush(name).await;
        if let Err(e) = &flushed {
            warn!(database = %name, error = %e, "Flush during close failed");
        }
        let saved = self.save_now(name).await;
        if let Err(e) = &saved {
            warn!(database = %name, error = %e, "Final save during close failed");
        }

        {
            let mut registry = self.inner.registry.lock();
            if let Some(entry) = registry.entries.get_mut(name) {
                entry.handle = None;
                entry.timers = Timers::default();
            }
        }
        info!(database = %name, "Closed database");

        flushed.and(saved)
    }

    /// Close every open handle in registration order
    ///
    /// Every database is attempted; the first error is returned.
    pub async fn close_all(&self) -> StorageResult<()> {
        let mut first_err = None;
        for name in self.names() {
            if let Err(e) = self.close(&name).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drain sequence for process exit: flush all, save all, close all
    pub async fn shutdown(&self) -> StorageResult<()> {
        info!("Shutting down database manager");
        let flushed = self.flush_all().await;
        let saved = self.save_all().await;
        let closed = self.close_all().await;
        flushed.and(saved).and(closed)
    }
}
