use crate::config::SchedulerConfig;
use crate::database::{GraphStore, Repository, RouteStore};
use crate::logging::{AuditLogger, AuditRecord, Component, RecordKind};
use crate::metrics::PerformanceMetrics;
use crate::services::graph_extractor::GraphExtractor;
use crate::services::session::SessionCache;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A named background task. Long tasks chunk their work and poll the
/// cancellation signal between chunks.
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, cancel: watch::Receiver<bool>) -> Result<()>;
}

/// Periodic runner for background agents (graph build, route pruning,
/// session cleanup, compliance sweeps). Tasks live in their own task group,
/// never block request handling, and pause themselves under backpressure.
pub struct Scheduler {
    config: SchedulerConfig,
    metrics: Arc<PerformanceMetrics>,
    audit: AuditLogger,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, metrics: Arc<PerformanceMetrics>, audit: AuditLogger) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            metrics,
            audit,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, interval_seconds: u64, task: Arc<dyn BackgroundTask>) {
        if !self.config.enabled {
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let cancel_rx = self.shutdown_tx.subscribe();
        let metrics = self.metrics.clone();
        let audit = self.audit.clone();
        let backpressure_ms = self.config.backpressure_latency_ms as f64;
        let name = task.name();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
            // First tick fires immediately; skip it so tasks start one full
            // interval after boot.
            ticker.tick().await;

            info!("Scheduled task '{}' every {}s", name, interval_seconds);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Task '{}' stopping (shutdown)", name);
                        return;
                    }
                    _ = ticker.tick() => {
                        // Backpressure: stay out of the way while the request
                        // path is slow.
                        let latency = metrics.mean_request_latency_ms();
                        if latency > backpressure_ms {
                            warn!(
                                "Task '{}' paused (request latency {:.0}ms over {:.0}ms)",
                                name, latency, backpressure_ms
                            );
                            continue;
                        }

                        let start = Instant::now();
                        match task.run(cancel_rx.clone()).await {
                            Ok(()) => {
                                debug!("Task '{}' completed in {:?}", name, start.elapsed());
                                audit.log(
                                    AuditRecord::builder(
                                        format!("task-{}", name),
                                        Component::Scheduler,
                                        RecordKind::TaskRun,
                                    )
                                    .message(name)
                                    .duration(start.elapsed().as_millis() as i32)
                                    .build(),
                                );
                            }
                            Err(e) => {
                                error!("Task '{}' failed: {}", name, e);
                                audit.log(
                                    AuditRecord::builder(
                                        format!("task-{}", name),
                                        Component::Scheduler,
                                        RecordKind::TaskRun,
                                    )
                                    .message(name)
                                    .error(e.to_string())
                                    .build(),
                                );
                            }
                        }
                    }
                }
            }
        });

        self.handles.push(handle);
    }

    /// Stop all tasks with a bounded grace period.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);

        for handle in self.handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("A scheduler task did not stop within the grace period, aborting");
            }
        }
        info!("Scheduler stopped");
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

// ===== Concrete tasks =====

/// Extract graph entities/relationships from recently ingested parents.
pub struct GraphBuildTask {
    pub repository: Arc<Repository>,
    pub graph: Arc<GraphStore>,
    pub extractor: Arc<GraphExtractor>,
    pub batch_size: i64,
}

#[async_trait]
impl BackgroundTask for GraphBuildTask {
    fn name(&self) -> &'static str {
        "graph_build"
    }

    async fn run(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let parents = self.repository.recent_parents(self.batch_size).await?;
        let mut extracted_entities = 0usize;

        for parent in parents {
            if is_cancelled(&cancel) {
                info!("graph_build cancelled mid-sweep");
                return Ok(());
            }

            let context = format!("{} {}", parent.document_id, parent.hierarchy_path);
            let graph = match self.extractor.extract(&parent.full_text, &context).await {
                Ok(graph) => graph,
                Err(e) => {
                    warn!("Extraction failed for {}: {}", parent.key(), e);
                    continue;
                }
            };

            for entity in &graph.entities {
                if let Err(e) = self.graph.upsert_entity(entity).await {
                    warn!("Entity upsert failed: {}", e);
                }
            }
            for relationship in &graph.relationships {
                if let Err(e) = self.graph.upsert_relationship(relationship).await {
                    debug!("Relationship skipped: {}", e);
                }
            }
            extracted_entities += graph.entities.len();

            // Yield between parents so a long sweep never monopolizes a worker.
            tokio::task::yield_now().await;
        }

        if extracted_entities > 0 {
            info!("graph_build extracted {} entities", extracted_entities);
        }
        Ok(())
    }
}

/// Drop golden routes that never get hit.
pub struct GoldenRoutePruneTask {
    pub routes: Arc<RouteStore>,
    pub min_hits: i64,
}

#[async_trait]
impl BackgroundTask for GoldenRoutePruneTask {
    fn name(&self) -> &'static str {
        "golden_route_prune"
    }

    async fn run(&self, _cancel: watch::Receiver<bool>) -> Result<()> {
        let pruned = self.routes.prune_stale(self.min_hits).await?;
        if pruned > 0 {
            info!("Pruned {} stale golden routes", pruned);
        }
        Ok(())
    }
}

/// Evict expired ephemeral sessions.
pub struct SessionCleanupTask {
    pub sessions: SessionCache,
}

#[async_trait]
impl BackgroundTask for SessionCleanupTask {
    fn name(&self) -> &'static str {
        "session_cleanup"
    }

    async fn run(&self, _cancel: watch::Receiver<bool>) -> Result<()> {
        self.sessions.cleanup_expired();
        Ok(())
    }
}

/// Compliance sweep: walk every canonical document and check the parent tree
/// invariants (single root, resolvable parent links). Violations are logged
/// as fatal-invariant audit records for follow-up.
pub struct ComplianceSweepTask {
    pub repository: Arc<Repository>,
    pub audit: AuditLogger,
    pub document_batch: i64,
}

#[async_trait]
impl BackgroundTask for ComplianceSweepTask {
    fn name(&self) -> &'static str {
        "compliance_sweep"
    }

    async fn run(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let document_ids = self.repository.list_document_ids(self.document_batch).await?;

        for document_id in document_ids {
            if is_cancelled(&cancel) {
                return Ok(());
            }

            let parents = self.repository.list_parents(&document_id).await?;
            if parents.is_empty() {
                continue;
            }

            let paths: std::collections::HashSet<&str> = parents
                .iter()
                .map(|p| p.hierarchy_path.as_str())
                .collect();

            let roots = parents.iter().filter(|p| p.parent_path.is_none()).count();
            let dangling: Vec<&str> = parents
                .iter()
                .filter_map(|p| p.parent_path.as_deref())
                .filter(|path| !paths.contains(path))
                .collect();

            if roots == 0 || !dangling.is_empty() {
                error!(
                    "Tree invariant violated for {}: {} roots, {} dangling links",
                    document_id,
                    roots,
                    dangling.len()
                );
                self.audit.log(
                    AuditRecord::builder(
                        format!("sweep-{}", document_id),
                        Component::Scheduler,
                        RecordKind::FatalInvariant,
                    )
                    .message(format!(
                        "document {}: {} roots, dangling: {:?}",
                        document_id, roots, dangling
                    ))
                    .status(crate::logging::AuditStatus::Error)
                    .build(),
                );
            }

            tokio::task::yield_now().await;
        }

        Ok(())
    }
}
