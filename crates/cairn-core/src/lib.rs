//! Cairn Core - Persistence and task memory for a desktop assistant
//!
//! This crate provides:
//! - Named in-memory SQLite databases backed by snapshot files
//! - Batched writes with debounced and periodic saves
//! - Task memory: duplicate detection, habits and next-action suggestions

pub mod config;
pub mod constants;
pub mod memory;
pub mod storage;

// Re-exports for convenience
pub use config::StorageSettings;
pub use memory::{TaskCheck, TaskCompletion, TaskMemory, TaskMemoryStore};
pub use storage::{DatabaseConfig, DatabaseManager, StorageError, StorageResult};
