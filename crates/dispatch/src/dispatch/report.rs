use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Outcome of draining one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub stream: Uuid,
    pub device: usize,
    /// Operations taken from the stream.
    pub operations: usize,
    /// Operations whose closure ran and succeeded.
    pub completed: usize,
    /// Position of the operation that failed, if any.
    pub failed_at: Option<usize>,
    /// Operations not run because of the failure.
    pub skipped: usize,
    pub duration: Duration,
}

impl StreamReport {
    pub(super) fn empty(stream: Uuid, device: usize) -> Self {
        Self {
            stream,
            device,
            operations: 0,
            completed: 0,
            failed_at: None,
            skipped: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed_at.is_none()
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    /// 1-based pass number.
    pub pass: u64,
    pub streams: usize,
    pub operations: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
    /// One entry per stream, in registration order.
    pub reports: Vec<StreamReport>,
}

impl DrainReport {
    pub(super) fn from_streams(pass: u64, reports: Vec<StreamReport>, duration: Duration) -> Self {
        Self {
            pass,
            streams: reports.len(),
            operations: reports.iter().map(|r| r.operations).sum(),
            failed: reports.iter().filter(|r| !r.succeeded()).count(),
            skipped: reports.iter().map(|r| r.skipped).sum(),
            duration,
            reports,
        }
    }

    /// True when every operation of every stream succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
