//! Store metrics.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       StoreMetrics                        │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐  │
//! │  │  Counters    │  │   Gauges      │  │  Histograms    │  │
//! │  │ - sts        │  │ - cbq_depth   │  │ - cb_latency   │  │
//! │  │ - fragments  │  │ - has_standby │  │ - batch_write  │  │
//! │  │ - acks/bytes │  │               │  │                │  │
//! │  │ - sync runs  │  │               │  │                │  │
//! │  └──────────────┘  └───────────────┘  └────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod histograms;
mod meters;

pub use histograms::{Histogram, HistogramSnapshot, LATENCY_BUCKETS};
pub use meters::{Counter, Gauge};

use tracing::info;

/// Counters shared by every thread of one node.
#[derive(Debug)]
pub struct StoreMetrics {
    pub sts_committed: Counter,
    pub frags_sent: Counter,
    pub frags_received: Counter,
    pub acks_sent: Counter,
    pub acks_received: Counter,
    pub bytes_written: Counter,
    pub records_written: Counter,
    pub callbacks_delivered: Counter,
    pub sync_attempts: Counter,
    pub sync_failures: Counter,
    pub checkpoints_written: Counter,

    pub cbq_depth: Gauge,
    pub has_standby: Gauge,

    pub cb_latency: Histogram,
    pub batch_write: Histogram,
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            sts_committed: Counter::new(),
            frags_sent: Counter::new(),
            frags_received: Counter::new(),
            acks_sent: Counter::new(),
            acks_received: Counter::new(),
            bytes_written: Counter::new(),
            records_written: Counter::new(),
            callbacks_delivered: Counter::new(),
            sync_attempts: Counter::new(),
            sync_failures: Counter::new(),
            checkpoints_written: Counter::new(),
            cbq_depth: Gauge::new(),
            has_standby: Gauge::new(),
            cb_latency: Histogram::new(LATENCY_BUCKETS),
            batch_write: Histogram::new(LATENCY_BUCKETS),
        }
    }

    /// Log the totals; called once when a node stops.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            sts = s.sts_committed,
            records = s.records_written,
            bytes = s.bytes_written,
            frags_sent = s.frags_sent,
            frags_received = s.frags_received,
            callbacks = s.callbacks_delivered,
            syncs = s.sync_attempts,
            sync_failures = s.sync_failures,
            checkpoints = s.checkpoints_written,
            cb_mean_secs = s.cb_latency.mean(),
            "store metrics"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sts_committed: self.sts_committed.get(),
            frags_sent: self.frags_sent.get(),
            frags_received: self.frags_received.get(),
            acks_sent: self.acks_sent.get(),
            acks_received: self.acks_received.get(),
            bytes_written: self.bytes_written.get(),
            records_written: self.records_written.get(),
            callbacks_delivered: self.callbacks_delivered.get(),
            sync_attempts: self.sync_attempts.get(),
            sync_failures: self.sync_failures.get(),
            checkpoints_written: self.checkpoints_written.get(),
            cbq_depth: self.cbq_depth.get(),
            has_standby: self.has_standby.get() != 0,
            cb_latency: self.cb_latency.snapshot(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub sts_committed: u64,
    pub frags_sent: u64,
    pub frags_received: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub bytes_written: u64,
    pub records_written: u64,
    pub callbacks_delivered: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub checkpoints_written: u64,
    pub cbq_depth: i64,
    pub has_standby: bool,
    pub cb_latency: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_snapshot() {
        let m = StoreMetrics::new();
        m.sts_committed.inc_by(3);
        m.has_standby.set(1);
        m.cb_latency.observe_duration(Duration::from_millis(1));
        let snap = m.snapshot();
        assert_eq!(snap.sts_committed, 3);
        assert!(snap.has_standby);
        assert_eq!(snap.cb_latency.count, 1);
    }
}
