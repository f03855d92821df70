//! Habit statistics
//!
//! A habit is a recurring task pattern with a use count and a running
//! success rate. Habits drive next-action suggestions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::similarity::{derive_pattern, short_hash};

/// A mined recurring pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserHabit {
    /// Hash of `pattern`
    pub id: String,
    pub pattern: String,
    pub frequency: u32,
    pub last_used_at: DateTime<Utc>,
    /// Running average of outcomes, 0.0..=1.0
    pub success_rate: f64,
    pub suggested_actions: Vec<String>,
    /// Context of the most recent occurrence
    pub context: String,
}

impl UserHabit {
    /// First occurrence of a pattern
    pub fn new(task_type: &str, input: &str, success: bool, context: &str) -> Self {
        let pattern = derive_pattern(task_type, input);
        Self {
            id: short_hash(&pattern),
            pattern,
            frequency: 1,
            last_used_at: Utc::now(),
            success_rate: if success { 1.0 } else { 0.0 },
            suggested_actions: suggested_actions_for(task_type),
            context: context.to_string(),
        }
    }

    /// Fold another occurrence into the statistics
    pub fn record_occurrence(&mut self, success: bool, context: &str) {
        self.frequency += 1;
        let n = self.frequency as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + outcome) / n;
        self.last_used_at = Utc::now();
        self.context = context.to_string();
    }

    /// Task type portion of the pattern
    pub fn task_type(&self) -> &str {
        self.pattern
            .split_once(':')
            .map_or(self.pattern.as_str(), |(kind, _)| kind)
    }

    /// Content-word portion of the pattern
    pub fn words(&self) -> &str {
        self.pattern.split_once(':').map_or("", |(_, words)| words)
    }
}

/// Follow-up actions offered for a task type
pub fn suggested_actions_for(task_type: &str) -> Vec<String> {
    let actions: &[&str] = match task_type {
        "email_composition" => &["schedule follow-up", "save to drafts", "add to calendar"],
        "app_launch" => &["open recent files", "arrange windows"],
        "web_search" => &["save results", "open top result"],
        "file_operation" => &["open containing folder", "share file"],
        "text_extraction" => &["copy to clipboard", "save as note"],
        "calendar_event" => &["set reminder", "invite attendees"],
        _ => &[],
    };
    actions.iter().map(|a| a.to_string()).collect()
}
