//! Per-run session state
//!
//! Lives only in memory and is rebuilt on every process start, so a new
//! session id marks the boundary for in-session duplicate detection.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::memory::{CONTEXT_SNAPSHOTS_CAP, RECENT_COMMANDS_CAP};

/// A point-in-time capture of what the user was working in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSnapshot {
    pub captured_at: DateTime<Utc>,
    pub context: String,
}

/// Transient state for one process run
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Sliding window, oldest first
    pub recent_commands: VecDeque<String>,
    pub completed_task_ids: Vec<String>,
    /// Sliding window, oldest first
    pub context_snapshots: VecDeque<ContextSnapshot>,
}

impl SessionContext {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("session_{}", uuid::Uuid::new_v4().simple()),
            start_time: now,
            last_activity: now,
            recent_commands: VecDeque::with_capacity(RECENT_COMMANDS_CAP),
            completed_task_ids: Vec::new(),
            context_snapshots: VecDeque::with_capacity(CONTEXT_SNAPSHOTS_CAP),
        }
    }

    /// Note a completed task: its input joins the command window, its id the history
    pub fn record_task(&mut self, input: &str, task_id: &str) {
        push_capped(&mut self.recent_commands, input.to_string(), RECENT_COMMANDS_CAP);
        self.completed_task_ids.push(task_id.to_string());
        self.touch();
    }

    pub fn add_snapshot(&mut self, context: &str) {
        push_capped(
            &mut self.context_snapshots,
            ContextSnapshot {
                captured_at: Utc::now(),
                context: context.to_string(),
            },
            CONTEXT_SNAPSHOTS_CAP,
        );
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// The last `n` commands, oldest first
    pub fn last_commands(&self, n: usize) -> Vec<&str> {
        let skip = self.recent_commands.len().saturating_sub(n);
        self.recent_commands
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect()
    }

    pub fn has_history(&self) -> bool {
        !self.completed_task_ids.is_empty()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

fn push_capped<T>(window: &mut VecDeque<T>, item: T, cap: usize) {
    while window.len() >= cap {
        window.pop_front();
    }
    window.push_back(item);
}
