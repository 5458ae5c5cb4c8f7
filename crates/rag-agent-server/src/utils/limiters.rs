use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded concurrency per external resource. Callers wait with a deadline;
/// an exhausted pool surfaces as an acquire timeout, never an unbounded queue.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub vector_search: Arc<Semaphore>,
    pub db: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
    pub rerank: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &crate::config::LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            vector_search: Arc::new(Semaphore::new(cfg.vector_search_concurrency.max(1))),
            db: Arc::new(Semaphore::new(cfg.db_concurrency.max(1))),
            llm: Arc::new(Semaphore::new(cfg.llm_concurrency.max(1))),
            rerank: Arc::new(Semaphore::new(cfg.rerank_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> crate::config::LimitsConfig {
        crate::config::LimitsConfig {
            embedding_concurrency: 1,
            vector_search_concurrency: 1,
            db_concurrency: 1,
            llm_concurrency: 1,
            rerank_concurrency: 1,
            acquire_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiters = Limiters::new(&test_cfg());
        let (permit, wait) =
            Limiters::acquire_timed(limiters.llm.clone(), limiters.acquire_timeout, "llm")
                .await
                .unwrap();
        assert!(wait < Duration::from_millis(50));
        drop(permit);

        // Slot freed, second acquire succeeds immediately.
        let (_permit, _) =
            Limiters::acquire_timed(limiters.llm.clone(), limiters.acquire_timeout, "llm")
                .await
                .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let limiters = Limiters::new(&test_cfg());
        let _held =
            Limiters::acquire_timed(limiters.db.clone(), limiters.acquire_timeout, "db")
                .await
                .unwrap();

        let result =
            Limiters::acquire_timed(limiters.db.clone(), limiters.acquire_timeout, "db").await;
        assert!(result.is_err());
    }
}
