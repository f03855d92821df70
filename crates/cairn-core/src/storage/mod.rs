//! Persistence layer
//!
//! Named in-memory SQLite databases with:
//! - A registry that loads each database from its snapshot file on first use
//! - A per-database batch queue flushed as one transaction
//! - Debounced and periodic snapshot saves, written atomically

mod batch;
mod error;
mod persistence;
mod registry;


pub use batch::BatchOperation;
pub use error::{StorageError, StorageResult};
pub use persistence::snapshot_temp_path;
pub use registry::{DatabaseConfig, DatabaseHandle, DatabaseManager};
pub use rusqlite::types::Value;
