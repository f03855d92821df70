//! Storage configuration
//!
//! Tunables for the database registry and the task memory store. Read from
//! `config.toml` in the data directory when present; every field falls back
//! to the defaults in [`crate::constants`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Settings shared by the registry and the task memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding snapshot files and logs
    pub data_dir: PathBuf,
    /// Queue length that triggers an automatic flush
    pub batch_threshold: usize,
    /// Debounce delay for save requests, in milliseconds
    pub save_debounce_ms: u64,
    /// Autosave period for databases registered with autosave on
    pub autosave_interval_ms: u64,
    /// Minimum spacing between habit flushes, in seconds
    pub habit_flush_interval_secs: u64,
    /// Period of the background cleanup task, in seconds
    pub cleanup_interval_secs: u64,
    pub task_retention_days: i64,
    pub habit_retention_days: i64,
    pub habit_min_frequency: u32,
    /// Window in which a cross-session exact repeat counts as a duplicate
    pub cross_session_window_hours: u64,
    pub similarity_threshold: f64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_threshold: constants::storage::BATCH_THRESHOLD,
            save_debounce_ms: constants::storage::SAVE_DEBOUNCE.as_millis() as u64,
            autosave_interval_ms: constants::storage::AUTOSAVE_INTERVAL.as_millis() as u64,
            habit_flush_interval_secs: constants::memory::HABIT_FLUSH_INTERVAL.as_secs(),
            cleanup_interval_secs: constants::memory::CLEANUP_INTERVAL.as_secs(),
            task_retention_days: constants::memory::TASK_RETENTION_DAYS,
            habit_retention_days: constants::memory::HABIT_RETENTION_DAYS,
            habit_min_frequency: constants::memory::HABIT_MIN_FREQUENCY,
            cross_session_window_hours: constants::memory::CROSS_SESSION_WINDOW.as_secs() / 3600,
            similarity_threshold: constants::memory::SIMILARITY_THRESHOLD,
        }
    }
}

impl StorageSettings {
    /// Settings rooted at a specific data directory, all other fields default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from `<data_dir>/config.toml`, or defaults if the file is absent
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(constants::paths::CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::with_data_dir(data_dir));
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table: toml::Table = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let names_data_dir = table.contains_key("data_dir");
        let mut settings: Self = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        // The file's directory is the data directory unless the file says otherwise;
        // a relative data_dir is resolved against it
        if !names_data_dir {
            settings.data_dir = data_dir.to_path_buf();
        } else if settings.data_dir.is_relative() {
            settings.data_dir = data_dir.join(&settings.data_dir);
        }
        tracing::debug!(path = %path.display(), "Loaded storage settings");
        Ok(settings)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    pub fn habit_flush_interval(&self) -> Duration {
        Duration::from_secs(self.habit_flush_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn cross_session_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cross_session_window_hours as i64)
    }

    /// Snapshot path for the task memory database
    pub fn task_memory_path(&self) -> PathBuf {
        self.data_dir.join(constants::memory::DATABASE_FILE)
    }

    /// Directory for log files
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(constants::paths::LOGS_DIR_NAME)
    }
}

/// Default data directory (`~/.cairn`), falling back to the working directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(constants::paths::DATA_DIR_NAME)
}
