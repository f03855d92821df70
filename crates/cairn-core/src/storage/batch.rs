//! Batched writes
//!
//! Each registered database owns a FIFO queue of pending statements. A flush
//! applies the whole queue inside one transaction: either every operation
//! lands or none does.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::registry::DatabaseManager;

/// A queued write
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub statement: String,
    pub parameters: Vec<Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl BatchOperation {
    pub fn new(statement: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            statement: statement.into(),
            parameters,
            enqueued_at: Utc::now(),
        }
    }
}

/// Apply `ops` in order inside a single transaction
///
/// Any failure rolls back the transaction (dropping it uncommitted) and
/// reports the index of the failing operation.
pub(super) fn apply_batch(
    name: &str,
    conn: &mut Connection,
    ops: &[BatchOperation],
) -> StorageResult<()> {
    let tx = conn.transaction()?;

    for (index, op) in ops.iter().enumerate() {
        tx.execute(&op.statement, params_from_iter(op.parameters.iter()))
            .map_err(|source| StorageError::TransactionFailed {
                name: name.to_string(),
                index,
                source,
            })?;
    }

    tx.commit().map_err(|source| StorageError::TransactionFailed {
        name: name.to_string(),
        index: ops.len(),
        source,
    })
}

impl DatabaseManager {
    /// Queue a write, flushing automatically once the queue reaches the threshold
    pub async fn enqueue(
        &self,
        name: &str,
        statement: impl Into<String>,
        params: Vec<Value>,
    ) -> StorageResult<()> {
        self.enqueue_operation(name, BatchOperation::new(statement, params))
            .await
    }

    /// Queue several writes, preserving their order
    pub async fn batch_execute(&self, name: &str, ops: Vec<BatchOperation>) -> StorageResult<()> {
        for op in ops {
            self.enqueue_operation(name, op).await?;
        }
        Ok(())
    }

    async fn enqueue_operation(&self, name: &str, op: BatchOperation) -> StorageResult<()> {
        let should_flush = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| StorageError::NotRegisteredForBatching(name.to_string()))?;
            entry.queue.push(op);
            entry.queue.len() >= self.inner.batch_threshold
        };

        if should_flush {
            self.flush(name).await?;
        }
        Ok(())
    }

    /// Number of queued writes for `name`
    pub fn pending_writes(&self, name: &str) -> usize {
        self.inner
            .registry
            .lock()
            .entries
            .get(name)
            .map_or(0, |e| e.queue.len())
    }

    /// Apply every queued write for `name` in one transaction
    ///
    /// The queue is cleared whether or not the flush succeeds, including when
    /// the database cannot be opened; failed operations are not retried. A successful flush requests a debounced save.
    pub async fn flush(&self, name: &str) -> StorageResult<()> {
        {
            let registry = self.inner.registry.lock();
            let entry = registry
                .entries
                .get(name)
                .ok_or_else(|| StorageError::NotRegisteredForBatching(name.to_string()))?;
            if entry.queue.is_empty() {
                return Ok(());
            }
        }

        let handle = match self.handle(name).await {
            Ok(handle) => handle,
            Err(e) => {
                let dropped = self.take_queue(name).len();
                warn!(
                    database = %name,
                    operations = dropped,
                    error = %e,
                    "Batch dropped, database unavailable"
                );
                return Err(e);
            }
        };

        let ops = self.take_queue(name);
        if ops.is_empty() {
            return Ok(());
        }

        let count = ops.len();
        if let Err(e) = handle.with_conn_mut(|conn| apply_batch(name, conn, &ops)) {
            warn!(database = %name, operations = count, error = %e, "Batch rolled back");
            return Err(e);
        }

        debug!(database = %name, operations = count, "Flushed batch");
        self.request_save(name);
        Ok(())
    }

    fn take_queue(&self, name: &str) -> Vec<BatchOperation> {
        self.inner
            .registry
            .lock()
            .entries
            .get_mut(name)
            .map(|e| std::mem::take(&mut e.queue))
            .unwrap_or_default()
    }

    /// Flush every database in registration order
    pub async fn flush_all(&self) -> StorageResult<()> {
        let mut first_err = None;
        for name in self.names() {
            if let Err(e) = self.flush(&name).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
