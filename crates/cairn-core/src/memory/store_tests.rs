//! Tests for the task memory store

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::config::StorageSettings;
    use crate::constants::memory::DATABASE_NAME;
    use crate::memory::{TaskCompletion, TaskMemoryStore};
    use crate::storage::{DatabaseManager, Value};

    fn settings(temp: &TempDir) -> StorageSettings {
        let mut settings = StorageSettings::with_data_dir(temp.path());
        settings.save_debounce_ms = 20;
        settings
    }

    async fn open_store(temp: &TempDir) -> TaskMemoryStore {
        let settings = settings(temp);
        let db = DatabaseManager::new(&settings);
        TaskMemoryStore::open(db, &settings)
            .await
            .expect("Failed to open store")
    }

    async fn close_store(store: TaskMemoryStore) {
        store.shutdown().await.unwrap();
        store.database().shutdown().await.unwrap();
    }

    async fn rows_for_hash(store: &TaskMemoryStore, hash: &str) -> i64 {
        store
            .database()
            .query_one(
                DATABASE_NAME,
                "SELECT COUNT(*) FROM task_memory WHERE task_hash = ?1",
                vec![Value::Text(hash.to_string())],
                |row| row.get(0),
            )
            .await
            .unwrap()
            .unwrap_or(0)
    }

    async fn age_task(store: &TaskMemoryStore, hash: &str, by: Duration) {
        let at = (Utc::now() - by).timestamp_millis();
        store
            .database()
            .execute(
                DATABASE_NAME,
                "UPDATE task_memory SET timestamp = ?1 WHERE task_hash = ?2",
                vec![Value::Integer(at), Value::Text(hash.to_string())],
            )
            .await
            .unwrap();
    }

    fn open_chrome() -> TaskCompletion {
        TaskCompletion::new("open chrome", "app_launch", "Launched Google Chrome", true)
    }

    #[tokio::test]
    async fn test_novel_task_without_history() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let check = store.check_task_completion("open chrome", "").await;
        assert!(!check.is_duplicate);
        assert!(check.previous_task.is_none());
        assert!(check.similarity.is_none());
    }

    #[tokio::test]
    async fn test_repeat_in_session_upserts_single_row() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let first = store.record_task_completion(open_chrome()).await;
        first.persisted.unwrap();
        let second = store
            .record_task_completion(TaskCompletion::new(
                "  OPEN chrome ",
                "app_launch",
                "Chrome already running",
                true,
            ))
            .await;
        assert_eq!(first.task.task_hash, second.task.task_hash);

        store.database().flush(DATABASE_NAME).await.unwrap();
        assert_eq!(rows_for_hash(&store, &first.task.task_hash).await, 1);

        let latest = store.recent_tasks(5).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].output, "Chrome already running");
        assert_eq!(latest[0].id, second.task.id);
    }

    #[tokio::test]
    async fn test_exact_repeat_in_session_is_duplicate() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.record_task_completion(open_chrome()).await;

        let check = store.check_task_completion("Open Chrome", "").await;
        assert!(check.is_duplicate);
        assert_eq!(
            check.previous_task.map(|t| t.input),
            Some("open chrome".to_string())
        );
    }

    #[tokio::test]
    async fn test_similar_task_in_session_is_not_duplicate() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.record_task_completion(open_chrome()).await;

        let check = store.check_task_completion("open chrome please", "").await;
        assert!(!check.is_duplicate);
        let score = check.similarity.expect("Expected a similarity match");
        assert!(score >= 0.8, "score was {score}");
        assert!(check.explanation.unwrap().contains("100%"));
        assert_eq!(check.previous_task.unwrap().input, "open chrome");
    }

    #[tokio::test]
    async fn test_dissimilar_task_is_novel() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.record_task_completion(open_chrome()).await;

        let check = store.check_task_completion("open safari browser", "").await;
        assert!(!check.is_duplicate);
        assert!(check.similarity.is_none());
    }

    #[tokio::test]
    async fn test_cross_session_duplicate_expires() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        let recorded = store.record_task_completion(open_chrome()).await.task;

        let old_session = store.session_id();
        let new_session = store.start_new_session().await.unwrap();
        assert_ne!(old_session, new_session);

        let check = store.check_task_completion("open chrome", "").await;
        assert!(check.is_duplicate);
        let previous = check.previous_task.unwrap();
        assert_eq!(previous.session_id, old_session);
        assert_eq!(previous.id, recorded.id);

        age_task(&store, &recorded.task_hash, Duration::hours(25)).await;
        let check = store.check_task_completion("open chrome", "").await;
        assert!(!check.is_duplicate);
        assert!(check.previous_task.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_detected_after_restart() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        let first_session = store.session_id();
        store
            .record_task_completion(open_chrome().with_context("desktop"))
            .await;
        close_store(store).await;

        let store = open_store(&temp).await;
        assert_ne!(store.session_id(), first_session);
        let check = store.check_task_completion("open chrome", "desktop").await;
        assert!(check.is_duplicate);
        assert!(check.explanation.unwrap().contains("earlier session"));

        // Different context, different fingerprint
        let other = store.check_task_completion("open chrome", "terminal").await;
        assert!(!other.is_duplicate);
    }

    #[tokio::test]
    async fn test_session_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        let before = store.session().last_activity;

        let recorded = store
            .record_task_completion(open_chrome().with_context("morning routine"))
            .await
            .task;
        store
            .record_task_completion(TaskCompletion::new(
                "check calendar",
                "calendar_event",
                "3 events today",
                true,
            ))
            .await;

        let session = store.session();
        assert_eq!(
            session.recent_commands.iter().collect::<Vec<_>>(),
            vec!["open chrome", "check calendar"]
        );
        assert_eq!(session.completed_task_ids.len(), 2);
        assert_eq!(session.completed_task_ids[0], recorded.id);
        assert_eq!(session.context_snapshots.len(), 1);
        assert_eq!(session.context_snapshots[0].context, "morning routine");
        assert!(session.last_activity >= before);
        assert_eq!(recorded.session_id, session.session_id);
    }

    #[tokio::test]
    async fn test_habit_success_rate_over_outcomes() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        for (i, success) in [true, false, true].into_iter().enumerate() {
            store
                .record_task_completion(TaskCompletion::new(
                    format!("search rust tutorials {}", "!".repeat(i)),
                    "web_search",
                    "results",
                    success,
                ))
                .await;
        }

        let habits = store.habits();
        assert_eq!(habits.len(), 1);
        assert_eq!(habits[0].pattern, "web_search:search rust tutorials");
        assert_eq!(habits[0].frequency, 3);
        assert!((habits[0].success_rate - 2.0 / 3.0).abs() < 1e-9);

        close_store(store).await;
        let store = open_store(&temp).await;
        let habits = store.habits();
        assert_eq!(habits.len(), 1);
        assert_eq!(habits[0].frequency, 3);
        assert!((habits[0].success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(habits[0].suggested_actions, vec!["save results", "open top result"]);
    }

    #[tokio::test]
    async fn test_habit_flush_is_gated() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        store.record_task_completion(open_chrome()).await;
        store
            .record_task_completion(TaskCompletion::new("launch spotify", "app_launch", "", true))
            .await;

        // First update flushed immediately, the second waits for the gate
        assert_eq!(store.flush_habits(false).await.unwrap(), 0);
        assert_eq!(store.flush_habits(true).await.unwrap(), 1);
        assert_eq!(store.flush_habits(true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_suggestion_requires_history() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        assert!(store.suggest_next_action("").is_none());
    }

    #[tokio::test]
    async fn test_suggestion_from_habit() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .record_task_completion(TaskCompletion::new(
                "write an email to John about the budget",
                "email_composition",
                "Draft created",
                true,
            ))
            .await;

        let suggestion = store.suggest_next_action("").expect("Expected a suggestion");
        assert_eq!(suggestion.action, "schedule follow-up");
        assert_eq!(suggestion.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_suggestion_matches_habit_despite_short_words() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        for success in [true, false, false] {
            store
                .record_task_completion(TaskCompletion::new(
                    "open new chrome window",
                    "app_launch",
                    "",
                    success,
                ))
                .await;
        }

        let habits = store.habits();
        assert_eq!(habits[0].pattern, "app_launch:open chrome window");

        let suggestion = store.suggest_next_action("").expect("Expected a suggestion");
        assert_eq!(suggestion.action, "open recent files");
        assert!((suggestion.confidence - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_suggestion_falls_back_to_last_task() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        store
            .record_task_completion(TaskCompletion::new("deploy staging", "shell_command", "", true))
            .await;
        assert!(store.suggest_next_action("").is_none());

        store
            .record_task_completion(TaskCompletion::new(
                "restart database",
                "shell_command",
                "exit 1",
                false,
            ))
            .await;
        let suggestion = store.suggest_next_action("").expect("Expected a retry");
        assert!(suggestion.action.contains("restart database"));
        assert_eq!(suggestion.confidence, 0.3);
    }

    #[tokio::test]
    async fn test_metadata_round_trips_through_storage() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .record_task_completion(
                TaskCompletion::new("compose reply", "email_composition", "sent", true)
                    .with_metadata("app", json!("Mail"))
                    .with_metadata("attempts", json!(2)),
            )
            .await;
        store.database().flush(DATABASE_NAME).await.unwrap();

        let tasks = store.recent_tasks(1).await.unwrap();
        assert_eq!(tasks[0].metadata.get("app"), Some(&json!("Mail")));
        assert_eq!(tasks[0].metadata.get("attempts"), Some(&json!(2)));
        assert!(tasks[0].success);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_tasks_and_stale_habits() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let old = store.record_task_completion(open_chrome()).await.task;
        store
            .record_task_completion(TaskCompletion::new("check weather", "web_search", "", true))
            .await;
        store.database().flush(DATABASE_NAME).await.unwrap();
        age_task(&store, &old.task_hash, Duration::days(8)).await;

        let long_ago = (Utc::now() - Duration::days(40)).timestamp_millis();
        for (id, frequency) in [("stale", 1), ("loyal", 5)] {
            store
                .database()
                .execute(
                    DATABASE_NAME,
                    "INSERT INTO user_habits (id, pattern, frequency, last_used, success_rate)
                     VALUES (?1, ?2, ?3, ?4, 1.0)",
                    vec![
                        Value::Text(id.to_string()),
                        Value::Text(format!("app_launch:{id}")),
                        Value::Integer(frequency),
                        Value::Integer(long_ago),
                    ],
                )
                .await
                .unwrap();
        }

        let stats = store.cleanup_old_data().await.unwrap();
        assert_eq!(stats.tasks_removed, 1);
        assert_eq!(stats.habits_removed, 1);
        assert_eq!(store.task_count().await.unwrap(), 1);

        let remaining: Vec<String> = store
            .database()
            .query(
                DATABASE_NAME,
                "SELECT id FROM user_habits ORDER BY id",
                vec![],
                |row| row.get(0),
            )
            .await
            .unwrap();
        assert!(remaining.contains(&"loyal".to_string()));
        assert!(!remaining.contains(&"stale".to_string()));
    }
}
