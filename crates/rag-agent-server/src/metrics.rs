use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide performance counters exposed at /api/performance/metrics and
/// consumed by the scheduler's backpressure check.
#[derive(Default)]
pub struct PerformanceMetrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub embedding_cache_hits: AtomicU64,
    pub embedding_cache_misses: AtomicU64,
    pub golden_route_hits: AtomicU64,
    pub orphan_children_filtered: AtomicU64,
    pub rerank_early_exits: AtomicU64,
    pub provider_fallbacks: AtomicU64,
    pub limiter_timeouts: AtomicU64,
    tool_latency: DashMap<String, LatencyHistogram>,
    request_latency: LatencyHistogram,
}

/// Fixed-bucket latency histogram (milliseconds).
#[derive(Default)]
pub struct LatencyHistogram {
    // Upper bounds: 50, 200, 1000, 5000, +inf
    buckets: [AtomicU64; 5],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

const BUCKET_BOUNDS_MS: [u64; 4] = [50, 200, 1000, 5000];

impl LatencyHistogram {
    pub fn record(&self, ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets_ms: vec![
                ("le_50".into(), self.buckets[0].load(Ordering::Relaxed)),
                ("le_200".into(), self.buckets[1].load(Ordering::Relaxed)),
                ("le_1000".into(), self.buckets[2].load(Ordering::Relaxed)),
                ("le_5000".into(), self.buckets[3].load(Ordering::Relaxed)),
                ("inf".into(), self.buckets[4].load(Ordering::Relaxed)),
            ],
            count: self.count.load(Ordering::Relaxed),
            mean_ms: self.mean_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets_ms: Vec<(String, u64)>,
    pub count: u64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub embedding_cache_hits: u64,
    pub embedding_cache_misses: u64,
    pub golden_route_hits: u64,
    pub orphan_children_filtered: u64,
    pub rerank_early_exits: u64,
    pub provider_fallbacks: u64,
    pub limiter_timeouts: u64,
    pub request_latency: HistogramSnapshot,
    pub tool_latency: Vec<(String, HistogramSnapshot)>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, ms: u64, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.request_latency.record(ms);
    }

    pub fn record_tool(&self, tool: &str, ms: u64) {
        self.tool_latency
            .entry(tool.to_string())
            .or_default()
            .record(ms);
    }

    /// Rolling mean request latency; the scheduler pauses background work
    /// while this exceeds its backpressure threshold.
    pub fn mean_request_latency_ms(&self) -> f64 {
        self.request_latency.mean_ms()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut tool_latency: Vec<(String, HistogramSnapshot)> = self
            .tool_latency
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        tool_latency.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            embedding_cache_hits: self.embedding_cache_hits.load(Ordering::Relaxed),
            embedding_cache_misses: self.embedding_cache_misses.load(Ordering::Relaxed),
            golden_route_hits: self.golden_route_hits.load(Ordering::Relaxed),
            orphan_children_filtered: self.orphan_children_filtered.load(Ordering::Relaxed),
            rerank_early_exits: self.rerank_early_exits.load(Ordering::Relaxed),
            provider_fallbacks: self.provider_fallbacks.load(Ordering::Relaxed),
            limiter_timeouts: self.limiter_timeouts.load(Ordering::Relaxed),
            request_latency: self.request_latency.snapshot(),
            tool_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let hist = LatencyHistogram::default();
        hist.record(10);
        hist.record(100);
        hist.record(900);
        hist.record(9000);

        let snap = hist.snapshot();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.buckets_ms[0].1, 1); // le_50
        assert_eq!(snap.buckets_ms[1].1, 1); // le_200
        assert_eq!(snap.buckets_ms[2].1, 1); // le_1000
        assert_eq!(snap.buckets_ms[4].1, 1); // inf
    }

    #[test]
    fn test_mean_latency() {
        let metrics = PerformanceMetrics::new();
        metrics.record_request(100, false);
        metrics.record_request(300, false);
        assert!((metrics.mean_request_latency_ms() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tool_latency_per_tool() {
        let metrics = PerformanceMetrics::new();
        metrics.record_tool("vector_search", 120);
        metrics.record_tool("calculator", 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.tool_latency.len(), 2);
        assert_eq!(snap.tool_latency[0].0, "calculator");
        assert_eq!(snap.tool_latency[1].0, "vector_search");
    }
}
