//! Line-delimited JSON requests for `cairn session`
//!
//! Each stdin line is one request tagged by `op`; each reply is one stdout
//! line. The whole stream shares a single task memory session, so in-session
//! duplicate checks and suggestions see earlier requests.

use std::collections::HashMap;

use anyhow::Result;
use cairn_core::{TaskCompletion, TaskMemoryStore};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Record {
        input: String,
        task_type: String,
        #[serde(default)]
        output: String,
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default)]
        context: String,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    Check {
        input: String,
        #[serde(default)]
        context: String,
    },
    Suggest {
        #[serde(default)]
        context: String,
    },
    Snapshot {
        context: String,
    },
    NewSession,
    Habits,
    Cleanup,
}

/// Run one request against the store
pub async fn handle(store: &TaskMemoryStore, request: Request) -> Result<Value> {
    let reply = match request {
        Request::Record {
            input,
            task_type,
            output,
            success,
            context,
            metadata,
        } => {
            let mut completion =
                TaskCompletion::new(input, task_type, output, success).with_context(context);
            completion.metadata = metadata;
            let recorded = store.record_task_completion(completion).await;
            json!({
                "task": recorded.task,
                "persisted": recorded.persisted.is_ok(),
                "error": recorded.persisted.err().map(|e| e.to_string()),
            })
        }
        Request::Check { input, context } => {
            serde_json::to_value(store.check_task_completion(&input, &context).await)?
        }
        Request::Suggest { context } => serde_json::to_value(store.suggest_next_action(&context))?,
        Request::Snapshot { context } => {
            store.add_context_snapshot(&context);
            json!({ "snapshots": store.session().context_snapshots.len() })
        }
        Request::NewSession => json!({ "session_id": store.start_new_session().await? }),
        Request::Habits => serde_json::to_value(store.habits())?,
        Request::Cleanup => serde_json::to_value(store.cleanup_old_data().await?)?,
    };
    Ok(reply)
}

/// Serve requests from stdin until it closes
pub async fn serve(store: &TaskMemoryStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                tracing::debug!(?request, "Session request");
                handle(store, request)
                    .await
                    .unwrap_or_else(|e| json!({ "error": e.to_string() }))
            }
            Err(e) => json!({ "error": format!("Invalid request: {e}") }),
        };

        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{DatabaseManager, StorageSettings};
    use tempfile::TempDir;

    #[test]
    fn test_parse_record_defaults() {
        let request: Request =
            serde_json::from_str(r#"{"op":"record","input":"open chrome","task_type":"app_launch"}"#)
                .unwrap();
        assert_eq!(
            request,
            Request::Record {
                input: "open chrome".to_string(),
                task_type: "app_launch".to_string(),
                output: String::new(),
                success: true,
                context: String::new(),
                metadata: HashMap::new(),
            }
        );
    }

    #[test]
    fn test_parse_unit_ops() {
        let request: Request = serde_json::from_str(r#"{"op":"new_session"}"#).unwrap();
        assert_eq!(request, Request::NewSession);
        assert!(serde_json::from_str::<Request>(r#"{"op":"teleport"}"#).is_err());
    }

    #[tokio::test]
    async fn test_record_then_check_in_one_session() {
        let temp = TempDir::new().unwrap();
        let settings = StorageSettings::with_data_dir(temp.path());
        let db = DatabaseManager::new(&settings);
        let store = TaskMemoryStore::open(db.clone(), &settings).await.unwrap();

        let recorded = handle(
            &store,
            serde_json::from_str(
                r#"{"op":"record","input":"open chrome","task_type":"app_launch","metadata":{"pid":42}}"#,
            )
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(recorded["persisted"], json!(true));
        assert_eq!(recorded["task"]["metadata"]["pid"], json!(42));

        let check = handle(
            &store,
            Request::Check {
                input: "open chrome".to_string(),
                context: String::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(check["is_duplicate"], json!(true));

        let suggestion = handle(
            &store,
            Request::Suggest {
                context: String::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(suggestion["action"], json!("open recent files"));

        store.shutdown().await.unwrap();
        db.shutdown().await.unwrap();
    }
}
