//! Snapshot persistence
//!
//! Two timer families per database both end in [`DatabaseManager::save_now`]:
//! - a debounce timer, restarted by every save request, that writes once the
//!   database has been quiet for the configured delay
//! - an optional fixed-period autosave, a backstop when nothing requests saves
//!
//! Saves for one database are serialized by a per-database async lock, and
//! each save writes `<file>.tmp` then renames it over the snapshot so a crash
//! never leaves a truncated file behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rusqlite::backup::Progress;
use rusqlite::DatabaseName;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::registry::{DatabaseHandle, DatabaseManager};
use crate::constants;

/// Timer state for one open database
pub(super) struct Timers {
    /// Parent token; cancelling it stops autosave and any pending debounce
    shutdown: CancellationToken,
    /// Token of the currently pending debounce timer
    debounce: Option<CancellationToken>,
    pub(super) autosave_running: bool,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            debounce: None,
            autosave_running: false,
        }
    }
}

impl Timers {
    pub(super) fn cancel(&self) {
        self.shutdown.cancel();
    }
}

/// Path the snapshot is staged at before the rename
pub fn snapshot_temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(constants::storage::SNAPSHOT_TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Copy the handle's database into `path` atomically
fn write_snapshot(handle: &DatabaseHandle, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = snapshot_temp_path(path);
    // A leftover from an interrupted save would otherwise be merged into by the backup
    if temp_path.exists() {
        std::fs::remove_file(&temp_path)?;
    }

    let backed_up =
        handle.with_conn(|conn| conn.backup(DatabaseName::Main, &temp_path, None::<fn(Progress)>));
    if let Err(e) = backed_up {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).context("snapshot backup failed");
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e)
            .with_context(|| format!("failed to move snapshot into {}", path.display()));
    }
    Ok(())
}

impl DatabaseManager {
    /// Schedule a save after the debounce delay, replacing any pending one
    ///
    /// Outside a tokio runtime nothing is scheduled; the next explicit save or
    /// autosave persists the change.
    pub fn request_save(&self, name: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(database = %name, "No async runtime, debounced save skipped");
            return;
        };

        let token = {
            let mut registry = self.inner.registry.lock();
            let Some(entry) = registry.entries.get_mut(name) else {
                debug!(database = %name, "Save requested for unknown database");
                return;
            };
            if let Some(previous) = entry.timers.debounce.take() {
                previous.cancel();
            }
            let token = entry.timers.shutdown.child_token();
            entry.timers.debounce = Some(token.clone());
            token
        };

        let manager = self.clone();
        let name = name.to_string();
        let delay = self.inner.save_debounce;
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Past this point the save runs to completion even if cancelled
            if let Err(e) = manager.save_now(&name).await {
                warn!(database = %name, error = %e, "Debounced save failed");
            }
        });
    }

    /// Start the fixed-period autosave timer for `name`
    ///
    /// Requires a tokio runtime; without one the timer is skipped with a warning.
    pub(super) fn start_autosave(&self, name: &str, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(database = %name, "No async runtime, autosave disabled");
            return;
        };

        let token = {
            let mut registry = self.inner.registry.lock();
            let Some(entry) = registry.entries.get_mut(name) else {
                return;
            };
            if entry.timers.autosave_running {
                return;
            }
            entry.timers.autosave_running = true;
            entry.timers.shutdown.clone()
        };

        let manager = self.clone();
        let name = name.to_string();
        let interval = interval.max(Duration::from_millis(1));
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.save_now(&name).await {
                            warn!(database = %name, error = %e, "Autosave failed");
                        }
                    }
                }
            }
            debug!(database = %name, "Autosave stopped");
        });
    }

    /// Write the database to its snapshot file now
    ///
    /// Waits for any save already in flight for the same name. A registered
    /// database that is not open has nothing to save.
    pub async fn save_now(&self, name: &str) -> StorageResult<()> {
        let (save_lock, path) = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get(name)
                .ok_or_else(|| StorageError::NotRegistered(name.to_string()))?;
            (entry.save_lock.clone(), entry.config.file_path.clone())
        };

        let _guard = save_lock.lock().await;

        // Re-check under the lock: the handle may have been closed while waiting
        let Some(handle) = self.open_handle(name) else {
            return Ok(());
        };

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&handle, &target))
            .await
            .map_err(|e| StorageError::PersistenceFailed {
                name: name.to_string(),
                source: anyhow::Error::new(e),
            })?
            .map_err(|source| StorageError::PersistenceFailed {
                name: name.to_string(),
                source,
            })?;

        debug!(database = %name, path = %path.display(), "Saved snapshot");
        Ok(())
    }

    /// Save every open database in registration order
    pub async fn save_all(&self) -> StorageResult<()> {
        let mut first_err = None;
        for name in self.names() {
            if let Err(e) = self.save_now(&name).await {
                warn!(database = %name, error = %e, "Save failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::storage::DatabaseConfig;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_temp_path_appends_suffix() {
        assert_eq!(
            snapshot_temp_path(Path::new("/data/app.db")),
            PathBuf::from("/data/app.db.tmp")
        );
        assert_eq!(
            snapshot_temp_path(Path::new("plain")),
            PathBuf::from("plain.tmp")
        );
    }

    #[test]
    fn test_write_snapshot_replaces_file_and_cleans_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("snap.db");

        let handle = DatabaseHandle::load("snap", &path).unwrap();
        handle.with_conn(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
                .unwrap();
        });
        write_snapshot(&handle, &path).unwrap();
        assert!(path.exists());
        assert!(!snapshot_temp_path(&path).exists());

        handle.with_conn(|conn| conn.execute("INSERT INTO t VALUES (8)", []).unwrap());
        write_snapshot(&handle, &path).unwrap();

        let reloaded = DatabaseHandle::load("snap", &path).unwrap();
        let total: i64 = reloaded.with_conn(|conn| {
            conn.query_row("SELECT SUM(x) FROM t", [], |row| row.get(0))
                .unwrap()
        });
        assert_eq!(total, 15);
    }

    #[test]
    fn test_write_snapshot_overwrites_stale_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snap.db");
        std::fs::write(snapshot_temp_path(&path), b"leftover garbage").unwrap();

        let handle = DatabaseHandle::load("snap", &path).unwrap();
        handle.with_conn(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap());
        write_snapshot(&handle, &path).unwrap();

        let reloaded = DatabaseHandle::load("snap", &path).unwrap();
        let tables: i64 = reloaded.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='t'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        });
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        // The snapshot path is taken by a directory, so the rename fails
        let path = temp.path().join("snap.db");
        std::fs::create_dir(&path).unwrap();

        let handle = DatabaseHandle::load("snap", &temp.path().join("source.db")).unwrap();
        handle.with_conn(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap());

        assert!(write_snapshot(&handle, &path).is_err());
        assert!(!snapshot_temp_path(&path).exists());
        assert!(path.is_dir());
    }

    #[test]
    fn test_request_save_outside_runtime_is_skipped() {
        let temp = TempDir::new().unwrap();
        let settings = StorageSettings::with_data_dir(temp.path());
        let manager = DatabaseManager::new(&settings);
        manager
            .register(DatabaseConfig::new("t", temp.path().join("t.db")))
            .unwrap();

        manager.request_save("t");
        manager.request_save("missing");
        assert!(!temp.path().join("t.db").exists());
    }
}
