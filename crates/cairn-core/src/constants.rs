//! Application constants and configuration defaults
//!
//! Centralized location for magic numbers and default values

use std::time::Duration;

/// Persistence engine configuration
pub mod storage {
    use super::*;

    /// Queue length that triggers an automatic batch flush
    pub const BATCH_THRESHOLD: usize = 10;

    /// Quiet period before a requested save is written to disk
    pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(1000);

    /// Default period of the autosave backstop timer
    pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

    /// Connection cap recorded on each database config
    pub const MAX_CONNECTIONS: u32 = 1;

    /// Suffix appended to a snapshot file name while it is being written
    pub const SNAPSHOT_TEMP_SUFFIX: &str = "tmp";
}

/// Task memory configuration
pub mod memory {
    use super::*;

    /// Logical database name owned by the task memory store
    pub const DATABASE_NAME: &str = "task_memory";

    /// Snapshot file name inside the data directory
    pub const DATABASE_FILE: &str = "task_memory.db";

    /// Sliding window of recent commands kept per session
    pub const RECENT_COMMANDS_CAP: usize = 20;

    /// Sliding window of context snapshots kept per session
    pub const CONTEXT_SNAPSHOTS_CAP: usize = 50;

    /// Habits loaded at startup (most recently used first)
    pub const HABITS_LOAD_LIMIT: usize = 100;

    /// Best-match score a session task must exceed to count as similar
    pub const SIMILARITY_THRESHOLD: f64 = 0.8;

    /// Weight of the input overlap in the similarity score (context gets the rest)
    pub const INPUT_WEIGHT: f64 = 0.7;

    /// Cross-session exact duplicates older than this are treated as new
    pub const CROSS_SESSION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

    /// Minimum spacing between habit flushes
    pub const HABIT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Period of the cleanup task
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

    /// Task records older than this are deleted by cleanup
    pub const TASK_RETENTION_DAYS: i64 = 7;

    /// Habits unused for this long become eligible for deletion
    pub const HABIT_RETENTION_DAYS: i64 = 30;

    /// Habits at or above this frequency survive cleanup regardless of age
    pub const HABIT_MIN_FREQUENCY: u32 = 3;

    /// Number of recent commands joined when matching habits
    pub const SUGGESTION_LOOKBACK: usize = 3;

    /// Content words taken from an input when deriving a habit pattern
    pub const PATTERN_WORDS: usize = 3;
}

/// Filesystem layout
pub mod paths {
    /// Data directory name under the user's home
    pub const DATA_DIR_NAME: &str = ".cairn";

    /// Config file name inside the data directory
    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// Log subdirectory name
    pub const LOGS_DIR_NAME: &str = "logs";
}
