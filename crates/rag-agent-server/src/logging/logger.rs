use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::AuditRecord;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity (max records in memory before drops)
    pub queue_capacity: usize,

    /// Batch size for database inserts
    pub batch_size: usize,

    /// Max wait time before flushing a partial batch (milliseconds)
    pub batch_timeout_ms: u64,

    /// Number of worker tasks for database inserts
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

/// Async audit logger with a bounded queue. `log()` is fire-and-forget: a
/// full queue drops the record with a warning rather than stalling a request.
#[derive(Clone)]
pub struct AuditLogger {
    sender: Sender<AuditRecord>,
}

impl AuditLogger {
    pub fn new(pool: PgPool, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing AuditLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config).await;
            });
        }

        Self { sender }
    }

    pub fn log(&self, record: AuditRecord) {
        if let Err(e) = self.sender.try_send(record) {
            warn!("Failed to enqueue audit record (queue full?): {}", e);
        }
    }

    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Receiver<AuditRecord>,
        config: LoggerConfig,
    ) {
        info!("Audit worker {} started", worker_id);

        let mut batch: Vec<AuditRecord> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(record)) => {
                        batch.push(record);
                    }
                    Ok(Err(_)) => {
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("Audit worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => {
                        // Timeout, flush what we have
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(pool: &PgPool, batch: &[AuditRecord], worker_id: usize) {
        debug!("Worker {} flushing {} audit records", worker_id, batch.len());

        if let Err(e) = Self::insert_batch(pool, batch).await {
            error!("Worker {} failed to insert audit batch: {}", worker_id, e);
        }
    }

    async fn insert_batch(pool: &PgPool, records: &[AuditRecord]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO agent_activity_log (
                request_id, conversation_id, user_id, component, kind, status,
                message, error_message, duration_ms, steps, custom_fields, created_at
            )
            "#,
        );

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(&record.request_id)
                .push_bind(&record.conversation_id)
                .push_bind(&record.user_id)
                .push_bind(record.component.as_str())
                .push_bind(record.kind.as_str())
                .push_bind(record.status.as_str())
                .push_bind(&record.message)
                .push_bind(&record.error_message)
                .push_bind(record.duration_ms)
                .push_bind(record.steps)
                .push_bind(record.custom_fields.as_ref().map(Json))
                .push_bind(record.created_at);
        });

        let result = query_builder.build().execute(pool).await?;

        Ok(result.rows_affected() as usize)
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }
}
