//! In-process counters for observation queries.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters of one reader or process.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    /// Upstream operations started.
    operations: AtomicU64,
    /// Operations that returned an error.
    failures: AtomicU64,
    /// Measure rows streamed through the parser.
    rows_read: AtomicU64,
    /// Result blocks appended to builders.
    blocks_emitted: AtomicU64,
    /// Result requests answered through a decimator.
    decimated_requests: AtomicU64,
    /// Count-only requests pushed down as `COUNT(*)`.
    count_pushdowns: AtomicU64,
}

/// Immutable snapshot view of [`QueryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMetricsSnapshot {
    pub operations: u64,
    pub failures: u64,
    pub rows_read: u64,
    pub blocks_emitted: u64,
    pub decimated_requests: u64,
    pub count_pushdowns: u64,
}

impl QueryMetrics {
    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows(&self, rows: u64) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_blocks(&self, blocks: u64) {
        self.blocks_emitted.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_decimation(&self) {
        self.decimated_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_count_pushdown(&self) {
        self.count_pushdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        QueryMetricsSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            blocks_emitted: self.blocks_emitted.load(Ordering::Relaxed),
            decimated_requests: self.decimated_requests.load(Ordering::Relaxed),
            count_pushdowns: self.count_pushdowns.load(Ordering::Relaxed),
        }
    }

    /// Renders the counters as `name value` lines.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        [
            ("obs_fusion_operations_total", s.operations),
            ("obs_fusion_failures_total", s.failures),
            ("obs_fusion_rows_read_total", s.rows_read),
            ("obs_fusion_blocks_emitted_total", s.blocks_emitted),
            ("obs_fusion_decimated_requests_total", s.decimated_requests),
            ("obs_fusion_count_pushdowns_total", s.count_pushdowns),
        ]
        .iter()
        .map(|(name, value)| format!("{name} {value}\n"))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = QueryMetrics::default();
        metrics.record_operation();
        metrics.record_operation();
        metrics.record_failure();
        metrics.record_rows(42);
        metrics.record_blocks(5);
        metrics.record_decimation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations, 2);
        assert_eq!(snapshot.rows_read, 42);
        assert_eq!(snapshot.count_pushdowns, 0);
        let text = metrics.render_text();
        assert!(text.contains("obs_fusion_blocks_emitted_total 5\n"));
        assert!(text.contains("obs_fusion_decimated_requests_total 1\n"));
    }
}
