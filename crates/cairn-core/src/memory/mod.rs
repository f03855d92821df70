//! Task memory
//!
//! Deduplication of repeated user requests and habit mining on top of the
//! persistence layer:
//! - Session context for the current process run
//! - Exact and near-duplicate detection
//! - Habit statistics and next-action suggestions

mod habits;
mod schema;
mod session;
mod similarity;
mod store;

#[cfg(test)]
mod store_tests;

pub use habits::{suggested_actions_for, UserHabit};
pub use session::{ContextSnapshot, SessionContext};
pub use similarity::{derive_pattern, task_hash, task_similarity, word_overlap};
pub use store::{
    ActionSuggestion, CleanupStats, RecordedTask, TaskCheck, TaskCompletion, TaskMemory,
    TaskMemoryStore,
};
