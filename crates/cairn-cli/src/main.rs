//! Cairn - Task memory for a desktop assistant
//!
//! Records what the assistant did, warns before it repeats itself and
//! suggests what usually comes next.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use cairn_core::config::default_data_dir;
use cairn_core::constants::memory::DATABASE_NAME;
use cairn_core::{DatabaseManager, StorageSettings, TaskCompletion, TaskMemoryStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod requests;

/// Cairn - Task memory and habits
#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Remembers completed tasks and the habits they form", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (defaults to ~/.cairn)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a completed task
    Record {
        input: String,
        /// Task category, e.g. app_launch or email_composition
        #[arg(short = 't', long = "type", default_value = "general")]
        task_type: String,
        #[arg(short, long, default_value = "")]
        output: String,
        #[arg(short, long, default_value = "")]
        context: String,
        /// Mark the task as failed
        #[arg(long)]
        failed: bool,
        /// Extra metadata as key=value, repeatable
        #[arg(short, long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Check whether a task was already done recently
    Check {
        input: String,
        #[arg(short, long, default_value = "")]
        context: String,
    },

    /// List known habits
    Habits,

    /// Show the newest stored tasks
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Delete old tasks and stale habits
    Cleanup,

    /// Show storage statistics
    Stats,

    /// Serve JSON requests from stdin within one session
    Session,
}

/// Initialize logging to a file so stdout stays machine-readable
fn init_logging(log_dir: &Path) {
    let writer = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(log_dir.join("cairn.log")))
        .map(|file| BoxMakeWriter::new(std::sync::Mutex::new(file)))
        .unwrap_or_else(|_| BoxMakeWriter::new(std::io::sink));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

/// Parse `key=value`; values that read as JSON keep their type
fn parse_metadata(pair: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("Metadata must be KEY=VALUE, got '{}'", pair);
    };
    let value = serde_json::from_str(raw).unwrap_or_else(|_| json!(raw));
    Ok((key.trim().to_string(), value))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, store: &Arc<TaskMemoryStore>) -> Result<()> {
    match command {
        Commands::Record {
            input,
            task_type,
            output,
            context,
            failed,
            metadata,
        } => {
            let mut completion =
                TaskCompletion::new(input, task_type, output, !failed).with_context(context);
            for pair in &metadata {
                let (key, value) = parse_metadata(pair)?;
                completion = completion.with_metadata(key, value);
            }
            let recorded = store.record_task_completion(completion).await;
            recorded.persisted?;
            print_json(&recorded.task)?;
        }
        Commands::Check { input, context } => {
            print_json(&store.check_task_completion(&input, &context).await)?;
        }
        Commands::Habits => print_json(&store.habits())?,
        Commands::Recent { limit } => print_json(&store.recent_tasks(limit).await?)?,
        Commands::Cleanup => print_json(&store.cleanup_old_data().await?)?,
        Commands::Stats => {
            let db = store.database();
            print_json(&json!({
                "generated_at": Utc::now(),
                "session_id": store.session_id(),
                "databases": db.names(),
                "tasks": store.task_count().await?,
                "habits": store.habits().len(),
                "pending_writes": db.pending_writes(DATABASE_NAME),
                "snapshot": db.config(DATABASE_NAME).map(|c| c.file_path),
            }))?;
        }
        Commands::Session => {
            store.spawn_maintenance();
            requests::serve(store).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let settings = StorageSettings::load(&data_dir)?;
    init_logging(&settings.logs_dir());
    tracing::info!(data_dir = %settings.data_dir.display(), "Starting cairn");

    let db = DatabaseManager::new(&settings);
    let store = Arc::new(TaskMemoryStore::open(db.clone(), &settings).await?);

    let result = run(cli.command, &store).await;

    // Drain before exit, even when the command failed
    let stopped = store.shutdown().await;
    let closed = db.shutdown().await;
    if let Err(e) = &closed {
        tracing::error!(error = %e, "Failed to persist databases on exit");
    }

    result?;
    stopped?;
    closed?;
    Ok(())
}
