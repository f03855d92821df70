//! Task memory store
//!
//! Records completed tasks, answers "have I done this already?" before a
//! caller repeats an expensive action, and mines recurring patterns into
//! habits that drive next-action suggestions.
//!
//! Bookkeeping never blocks the caller: read failures degrade to "novel
//! task" and write failures are reported in [`RecordedTask::persisted`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::habits::UserHabit;
use super::schema;
use super::session::SessionContext;
use super::similarity::{content_text, task_hash, task_similarity};
use crate::config::StorageSettings;
use crate::constants::memory::{DATABASE_NAME, HABITS_LOAD_LIMIT, SUGGESTION_LOOKBACK};
use crate::storage::{BatchOperation, DatabaseConfig, DatabaseManager, StorageResult, Value};

const TASK_COLUMNS: &str =
    "id, task_hash, task_type, input, context, output, success, timestamp, session_id, metadata";

const HABIT_COLUMNS: &str =
    "id, pattern, frequency, last_used, success_rate, suggested_actions, context";

/// A completed task as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMemory {
    pub id: String,
    pub task_hash: String,
    pub task_type: String,
    pub input: String,
    pub context: String,
    pub output: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskMemory {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let timestamp: i64 = row.get(7)?;
        let metadata: String = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            task_hash: row.get(1)?,
            task_type: row.get(2)?,
            input: row.get(3)?,
            context: row.get(4)?,
            output: row.get(5)?,
            success: row.get::<_, i64>(6)? != 0,
            timestamp: DateTime::from_timestamp_millis(timestamp).unwrap_or_default(),
            session_id: row.get(8)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        })
    }

    fn upsert_op(&self) -> StorageResult<BatchOperation> {
        Ok(BatchOperation::new(
            format!(
                "INSERT OR REPLACE INTO task_memory ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            vec![
                Value::Text(self.id.clone()),
                Value::Text(self.task_hash.clone()),
                Value::Text(self.task_type.clone()),
                Value::Text(self.input.clone()),
                Value::Text(self.context.clone()),
                Value::Text(self.output.clone()),
                Value::Integer(self.success as i64),
                Value::Integer(self.timestamp.timestamp_millis()),
                Value::Text(self.session_id.clone()),
                Value::Text(serde_json::to_string(&self.metadata)?),
            ],
        ))
    }

    /// Age relative to now, never negative
    pub fn age(&self) -> chrono::Duration {
        (Utc::now() - self.timestamp).max(chrono::Duration::zero())
    }
}

fn habit_from_row(row: &Row<'_>) -> rusqlite::Result<UserHabit> {
    let last_used: i64 = row.get(3)?;
    let actions: String = row.get(5)?;
    Ok(UserHabit {
        id: row.get(0)?,
        pattern: row.get(1)?,
        frequency: row.get::<_, i64>(2)?.max(0) as u32,
        last_used_at: DateTime::from_timestamp_millis(last_used).unwrap_or_default(),
        success_rate: row.get(4)?,
        suggested_actions: serde_json::from_str(&actions).unwrap_or_default(),
        context: row.get(6)?,
    })
}

fn habit_upsert_op(habit: &UserHabit) -> StorageResult<BatchOperation> {
    Ok(BatchOperation::new(
        format!("INSERT OR REPLACE INTO user_habits ({HABIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        vec![
            Value::Text(habit.id.clone()),
            Value::Text(habit.pattern.clone()),
            Value::Integer(habit.frequency as i64),
            Value::Integer(habit.last_used_at.timestamp_millis()),
            Value::Real(habit.success_rate),
            Value::Text(serde_json::to_string(&habit.suggested_actions)?),
            Value::Text(habit.context.clone()),
        ],
    ))
}

/// A task outcome to record
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub input: String,
    pub task_type: String,
    pub output: String,
    pub success: bool,
    pub context: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskCompletion {
    pub fn new(
        input: impl Into<String>,
        task_type: impl Into<String>,
        output: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            input: input.into(),
            task_type: task_type.into(),
            output: output.into(),
            success,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Result of a duplicate check
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCheck {
    /// Exact repeat, in this session or recently in another one
    pub is_duplicate: bool,
    /// The matching earlier task, exact or similar
    pub previous_task: Option<TaskMemory>,
    /// Score of a near-duplicate match
    pub similarity: Option<f64>,
    pub explanation: Option<String>,
}

impl TaskCheck {
    pub fn novel() -> Self {
        Self::default()
    }

    fn duplicate(task: TaskMemory, explanation: String) -> Self {
        Self {
            is_duplicate: true,
            previous_task: Some(task),
            similarity: None,
            explanation: Some(explanation),
        }
    }

    fn similar(task: TaskMemory, score: f64) -> Self {
        let explanation = format!(
            "{}% similar to \"{}\" completed earlier in this session",
            (score * 100.0).round() as i64,
            task.input
        );
        Self {
            is_duplicate: false,
            previous_task: Some(task),
            similarity: Some(score),
            explanation: Some(explanation),
        }
    }
}

/// Outcome of [`TaskMemoryStore::record_task_completion`]
///
/// The task is always recorded in the session; `persisted` says whether the
/// durable write and habit update went through. Callers may ignore it.
#[derive(Debug)]
pub struct RecordedTask {
    pub task: TaskMemory,
    pub persisted: StorageResult<()>,
}

/// A suggested next step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSuggestion {
    pub action: String,
    pub confidence: f64,
    pub reason: String,
}

/// Rows removed by a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub tasks_removed: usize,
    pub habits_removed: usize,
}

struct MemoryState {
    session: SessionContext,
    /// Tasks recorded in the current session, by task hash
    session_tasks: HashMap<String, TaskMemory>,
    /// Habits by id
    habits: HashMap<String, UserHabit>,
    dirty_habits: HashSet<String>,
    last_habit_flush: Option<Instant>,
}

/// Task memory on top of a [`DatabaseManager`]
pub struct TaskMemoryStore {
    db: DatabaseManager,
    settings: StorageSettings,
    state: Mutex<MemoryState>,
    maintenance: CancellationToken,
}

impl TaskMemoryStore {
    /// Register the task memory database, migrate it and load habits
    pub async fn open(db: DatabaseManager, settings: &StorageSettings) -> StorageResult<Self> {
        db.register(
            DatabaseConfig::new(DATABASE_NAME, settings.task_memory_path())
                .with_autosave_interval(settings.autosave_interval()),
        )?;

        let handle = db.handle(DATABASE_NAME).await?;
        if handle.with_conn(schema::run_migrations)? {
            db.request_save(DATABASE_NAME);
        }

        let habits = match Self::load_habits(&db).await {
            Ok(habits) => habits,
            Err(e) => {
                warn!(error = %e, "Failed to load habits, starting without them");
                HashMap::new()
            }
        };

        let session = SessionContext::new();
        info!(
            session_id = %session.session_id,
            habits = habits.len(),
            "Task memory ready"
        );

        Ok(Self {
            db,
            settings: settings.clone(),
            state: Mutex::new(MemoryState {
                session,
                session_tasks: HashMap::new(),
                habits,
                dirty_habits: HashSet::new(),
                last_habit_flush: None,
            }),
            maintenance: CancellationToken::new(),
        })
    }

    async fn load_habits(db: &DatabaseManager) -> StorageResult<HashMap<String, UserHabit>> {
        let habits = db
            .query(
                DATABASE_NAME,
                &format!("SELECT {HABIT_COLUMNS} FROM user_habits ORDER BY last_used DESC LIMIT ?1"),
                vec![Value::Integer(HABITS_LOAD_LIMIT as i64)],
                habit_from_row,
            )
            .await?;
        Ok(habits.into_iter().map(|h| (h.id.clone(), h)).collect())
    }

    /// The database manager this store writes through
    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session.session_id.clone()
    }

    /// Copy of the current session state
    pub fn session(&self) -> SessionContext {
        self.state.lock().session.clone()
    }

    /// Check whether a task was already done
    ///
    /// Order: exact repeat in this session, near-duplicate in this session,
    /// then exact repeat in any session within the cross-session window.
    pub async fn check_task_completion(&self, input: &str, context: &str) -> TaskCheck {
        let hash = task_hash(input, context);

        {
            let state = self.state.lock();
            if let Some(task) = state.session_tasks.get(&hash) {
                debug!(task_hash = %hash, "Exact repeat within session");
                return TaskCheck::duplicate(
                    task.clone(),
                    "Already completed in this session".to_string(),
                );
            }

            let best = state
                .session_tasks
                .values()
                .map(|task| {
                    let score = task_similarity(input, context, &task.input, &task.context);
                    (score, task)
                })
                .max_by(|a, b| a.0.total_cmp(&b.0));
            if let Some((score, task)) = best {
                if score > self.settings.similarity_threshold {
                    debug!(task_hash = %hash, score, "Similar task within session");
                    return TaskCheck::similar(task.clone(), score);
                }
            }
        }

        match self.latest_by_hash(&hash).await {
            Ok(Some(task)) if task.age() < self.settings.cross_session_window() => {
                let hours = task.age().num_hours();
                debug!(task_hash = %hash, hours, "Recent repeat from another session");
                let explanation = format!("Completed {} hour(s) ago in an earlier session", hours);
                TaskCheck::duplicate(task, explanation)
            }
            Ok(_) => TaskCheck::novel(),
            Err(e) => {
                warn!(task_hash = %hash, error = %e, "Duplicate lookup failed, assuming novel task");
                TaskCheck::novel()
            }
        }
    }

    async fn latest_by_hash(&self, hash: &str) -> StorageResult<Option<TaskMemory>> {
        self.db
            .query_one(
                DATABASE_NAME,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_memory
                     WHERE task_hash = ?1 ORDER BY timestamp DESC LIMIT 1"
                ),
                vec![Value::Text(hash.to_string())],
                TaskMemory::from_row,
            )
            .await
    }

    /// Record a completed task and update habit statistics
    pub async fn record_task_completion(&self, completion: TaskCompletion) -> RecordedTask {
        let task = {
            let mut state = self.state.lock();
            let task = TaskMemory {
                id: uuid::Uuid::new_v4().to_string(),
                task_hash: task_hash(&completion.input, &completion.context),
                task_type: completion.task_type,
                input: completion.input,
                context: completion.context,
                output: completion.output,
                success: completion.success,
                timestamp: Utc::now(),
                session_id: state.session.session_id.clone(),
                metadata: completion.metadata,
            };

            state
                .session_tasks
                .insert(task.task_hash.clone(), task.clone());
            state.session.record_task(&task.input, &task.id);
            if !task.context.trim().is_empty() {
                state.session.add_snapshot(&task.context);
            }
            task
        };

        let persisted = self.persist_task(&task).await;
        if let Err(e) = &persisted {
            warn!(task_hash = %task.task_hash, error = %e, "Failed to persist task");
        }

        let habits = self.update_habit(&task).await;
        if let Err(e) = &habits {
            warn!(task_type = %task.task_type, error = %e, "Failed to persist habits");
        }

        RecordedTask {
            task,
            persisted: persisted.and(habits),
        }
    }

    async fn persist_task(&self, task: &TaskMemory) -> StorageResult<()> {
        let op = task.upsert_op()?;
        self.db
            .enqueue(DATABASE_NAME, op.statement, op.parameters)
            .await
    }

    async fn update_habit(&self, task: &TaskMemory) -> StorageResult<()> {
        {
            let mut state = self.state.lock();
            let fresh = UserHabit::new(&task.task_type, &task.input, task.success, &task.context);
            let id = fresh.id.clone();
            match state.habits.get_mut(&id) {
                Some(habit) => habit.record_occurrence(task.success, &task.context),
                None => {
                    debug!(pattern = %fresh.pattern, "New habit");
                    state.habits.insert(id.clone(), fresh);
                }
            }
            state.dirty_habits.insert(id);
        }

        self.flush_habits(false).await.map(|_| ())
    }

    /// Write changed habits to the database
    ///
    /// Unless `force` is set, this is a no-op until the habit flush interval
    /// has passed since the previous flush. Returns the number written.
    pub async fn flush_habits(&self, force: bool) -> StorageResult<usize> {
        let (ids, dirty) = {
            let mut state = self.state.lock();
            let due = state
                .last_habit_flush
                .map_or(true, |at| at.elapsed() >= self.settings.habit_flush_interval());
            if !force && !due {
                return Ok(0);
            }
            state.last_habit_flush = Some(Instant::now());

            let ids: Vec<String> = state.dirty_habits.drain().collect();
            let dirty: Vec<UserHabit> = ids
                .iter()
                .filter_map(|id| state.habits.get(id).cloned())
                .collect();
            (ids, dirty)
        };
        if dirty.is_empty() {
            return Ok(0);
        }

        let written = dirty.len();
        let result = async {
            let ops = dirty
                .iter()
                .map(habit_upsert_op)
                .collect::<StorageResult<Vec<_>>>()?;
            self.db.batch_execute(DATABASE_NAME, ops).await?;
            self.db.flush(DATABASE_NAME).await
        }
        .await;

        if let Err(e) = result {
            // Keep them dirty for the next attempt
            self.state.lock().dirty_habits.extend(ids);
            return Err(e);
        }
        debug!(habits = written, "Flushed habits");
        Ok(written)
    }

    /// Habits, most recently used first
    pub fn habits(&self) -> Vec<UserHabit> {
        let mut habits: Vec<UserHabit> = self.state.lock().habits.values().cloned().collect();
        habits.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        habits
    }

    /// Suggest what to do next from habits, falling back to the last task
    pub fn suggest_next_action(&self, context: &str) -> Option<ActionSuggestion> {
        let state = self.state.lock();
        if !state.session.has_history() {
            return None;
        }

        let recent = content_text(&state.session.last_commands(SUGGESTION_LOOKBACK).join(" "));
        if !recent.is_empty() {
            let mut matches: Vec<&UserHabit> = state
                .habits
                .values()
                .filter(|h| !h.suggested_actions.is_empty())
                .filter(|h| {
                    let words = h.words();
                    !words.is_empty() && (recent.contains(words) || words.contains(recent.as_str()))
                })
                .collect();
            matches.sort_by(|a, b| {
                (b.context == context)
                    .cmp(&(a.context == context))
                    .then(b.frequency.cmp(&a.frequency))
                    .then(b.last_used_at.cmp(&a.last_used_at))
            });

            if let Some(habit) = matches.first() {
                return Some(ActionSuggestion {
                    action: habit.suggested_actions[0].clone(),
                    confidence: habit.success_rate,
                    reason: format!(
                        "You have done \"{}\" {} time(s) before",
                        habit.words(),
                        habit.frequency
                    ),
                });
            }
        }

        let last_id = state.session.completed_task_ids.last()?;
        let last = state.session_tasks.values().find(|t| &t.id == last_id)?;
        heuristic_suggestion(last)
    }

    /// Newest stored tasks across all sessions
    pub async fn recent_tasks(&self, limit: usize) -> StorageResult<Vec<TaskMemory>> {
        self.db
            .query(
                DATABASE_NAME,
                &format!("SELECT {TASK_COLUMNS} FROM task_memory ORDER BY timestamp DESC LIMIT ?1"),
                vec![Value::Integer(limit as i64)],
                TaskMemory::from_row,
            )
            .await
    }

    /// Number of stored task rows
    pub async fn task_count(&self) -> StorageResult<usize> {
        let count: Option<i64> = self
            .db
            .query_one(DATABASE_NAME, "SELECT COUNT(*) FROM task_memory", vec![], |row| {
                row.get(0)
            })
            .await?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    /// Add a context snapshot to the session
    pub fn add_context_snapshot(&self, context: &str) {
        let mut state = self.state.lock();
        state.session.add_snapshot(context);
        state.session.touch();
    }

    /// Start a new session, persisting what the old one queued
    pub async fn start_new_session(&self) -> StorageResult<String> {
        self.db.flush(DATABASE_NAME).await?;

        let mut state = self.state.lock();
        state.session = SessionContext::new();
        state.session_tasks.clear();
        info!(session_id = %state.session.session_id, "Started new session");
        Ok(state.session.session_id.clone())
    }

    /// Delete old tasks and stale, rarely used habits
    pub async fn cleanup_old_data(&self) -> StorageResult<CleanupStats> {
        // Pending rows must be on the handle before the cutoff applies to them
        self.flush_habits(true).await?;
        self.db.flush(DATABASE_NAME).await?;

        let now = Utc::now();
        let task_cutoff = now - chrono::Duration::days(self.settings.task_retention_days);
        let habit_cutoff = now - chrono::Duration::days(self.settings.habit_retention_days);
        let min_frequency = self.settings.habit_min_frequency;

        let tasks_removed = self
            .db
            .execute(
                DATABASE_NAME,
                "DELETE FROM task_memory WHERE timestamp < ?1",
                vec![Value::Integer(task_cutoff.timestamp_millis())],
            )
            .await?;
        let habits_removed = self
            .db
            .execute(
                DATABASE_NAME,
                "DELETE FROM user_habits WHERE last_used < ?1 AND frequency < ?2",
                vec![
                    Value::Integer(habit_cutoff.timestamp_millis()),
                    Value::Integer(min_frequency as i64),
                ],
            )
            .await?;

        {
            let mut state = self.state.lock();
            state
                .habits
                .retain(|_, h| h.last_used_at >= habit_cutoff || h.frequency >= min_frequency);
            state
                .session_tasks
                .retain(|_, t| t.timestamp >= task_cutoff);
        }

        let stats = CleanupStats {
            tasks_removed,
            habits_removed,
        };
        info!(
            tasks = stats.tasks_removed,
            habits = stats.habits_removed,
            "Cleaned up task memory"
        );
        Ok(stats)
    }

    /// Run cleanup and the habit flush gate periodically until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let token = self.maintenance.clone();
        let interval = self
            .settings
            .cleanup_interval()
            .max(std::time::Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup_old_data().await {
                            warn!(error = %e, "Scheduled cleanup failed");
                        }
                    }
                }
            }
            debug!("Task memory maintenance stopped");
        });
    }

    /// Stop maintenance and persist everything still pending
    ///
    /// The database itself stays open; closing it belongs to the
    /// [`DatabaseManager`] owner.
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.maintenance.cancel();
        let habits = self.flush_habits(true).await;
        let tasks = self.db.flush(DATABASE_NAME).await;
        info!("Task memory shut down");
        habits.map(|_| ()).and(tasks)
    }
}

/// Fallback suggestion from the most recent task alone
fn heuristic_suggestion(task: &TaskMemory) -> Option<ActionSuggestion> {
    if !task.success {
        return Some(ActionSuggestion {
            action: format!("Retry \"{}\"", task.input),
            confidence: 0.3,
            reason: "The last task did not succeed".to_string(),
        });
    }

    let (action, confidence, reason) = match task.task_type.as_str() {
        "email_composition" => (
            "Set a follow-up reminder for this email",
            0.6,
            "Emails often need a follow-up",
        ),
        "app_launch" => (
            "Open recent files in this app",
            0.5,
            "Apps are usually opened to resume work",
        ),
        "text_extraction" => (
            "Copy the extracted text to the clipboard",
            0.5,
            "Extracted text is usually pasted somewhere",
        ),
        "web_search" => ("Save the search results", 0.4, "Searches are often revisited"),
        "file_operation" => (
            "Open the containing folder",
            0.4,
            "File changes are usually checked afterwards",
        ),
        _ => return None,
    };

    Some(ActionSuggestion {
        action: action.to_string(),
        confidence,
        reason: reason.to_string(),
    })
}
