use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::operation::{OpCategory, Primitive};

/// Dispatcher state, as reported in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Idle,
    Draining,
}

/// Dispatcher operational metrics.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    /// Operations executed, by category. Failed operations count here too.
    pub ops_executed: HashMap<OpCategory, u64>,
    /// Average operation duration by category.
    pub avg_op_duration: HashMap<OpCategory, Duration>,
    /// Operations whose closure returned an error or panicked.
    pub ops_failed: u64,
    /// Operations never run because an earlier one in the stream failed.
    pub ops_skipped: u64,
    /// Total time spent waiting for each primitive.
    pub lock_wait: HashMap<Primitive, Duration>,
    /// Completed dispatch passes.
    pub passes: u64,
    /// Streams drained across all passes.
    pub streams_drained: u64,
    /// When the last pass finished.
    pub last_pass: Option<DateTime<Utc>>,
    /// Current dispatcher state.
    pub state: DispatchState,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self {
            ops_executed: HashMap::new(),
            avg_op_duration: HashMap::new(),
            ops_failed: 0,
            ops_skipped: 0,
            lock_wait: HashMap::new(),
            passes: 0,
            streams_drained: 0,
            last_pass: None,
            state: DispatchState::Idle,
        }
    }
}

impl DispatchMetrics {
    /// Record one executed operation.
    pub fn record_op(&mut self, category: OpCategory, duration: Duration, failed: bool) {
        let count = {
            let c = self.ops_executed.entry(category).or_default();
            *c += 1;
            *c
        };
        if failed {
            self.ops_failed += 1;
        }

        let prev_avg = self
            .avg_op_duration
            .get(&category)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_op_duration.insert(category, new_avg);
    }

    pub fn record_lock_wait(&mut self, primitive: Primitive, waited: Duration) {
        *self.lock_wait.entry(primitive).or_default() += waited;
    }

    pub fn record_skipped(&mut self, count: u64) {
        self.ops_skipped += count;
    }

    /// Record the end of a pass over `streams` streams.
    pub fn record_pass(&mut self, streams: usize) {
        self.passes += 1;
        self.streams_drained += streams as u64;
        self.last_pass = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_op() {
        let mut m = DispatchMetrics::default();
        m.record_op(OpCategory::Compute, Duration::from_millis(100), false);

        assert_eq!(m.ops_executed[&OpCategory::Compute], 1);
        assert_eq!(m.avg_op_duration[&OpCategory::Compute], Duration::from_millis(100));
        assert_eq!(m.ops_failed, 0);
    }

    #[test]
    fn record_multiple_ops_averages() {
        let mut m = DispatchMetrics::default();
        m.record_op(OpCategory::Transfer, Duration::from_millis(100), false);
        m.record_op(OpCategory::Transfer, Duration::from_millis(200), true);

        assert_eq!(m.ops_executed[&OpCategory::Transfer], 2);
        assert_eq!(m.ops_failed, 1);
        let avg = m.avg_op_duration[&OpCategory::Transfer].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn lock_wait_accumulates() {
        let mut m = DispatchMetrics::default();
        m.record_lock_wait(Primitive::Compute, Duration::from_millis(3));
        m.record_lock_wait(Primitive::Compute, Duration::from_millis(4));
        assert_eq!(m.lock_wait[&Primitive::Compute], Duration::from_millis(7));
        assert!(!m.lock_wait.contains_key(&Primitive::Transfer));
    }

    #[test]
    fn default_metrics() {
        let m = DispatchMetrics::default();
        assert_eq!(m.state, DispatchState::Idle);
        assert_eq!(m.passes, 0);
        assert!(m.last_pass.is_none());
        assert!(m.ops_executed.is_empty());
    }

    #[test]
    fn pass_bookkeeping() {
        let mut m = DispatchMetrics::default();
        m.record_pass(3);
        m.record_pass(2);
        assert_eq!(m.passes, 2);
        assert_eq!(m.streams_drained, 5);
        assert!(m.last_pass.is_some());
    }
}
