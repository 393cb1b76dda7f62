use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metrics::{DispatchMetrics, DispatchState};

/// Dispatcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
}

impl DispatchConfig {
    pub fn new(worker_threads: usize) -> Self {
        Self { worker_threads }
    }

    /// Resolve the actual worker thread count (0 → available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }
}

/// Drives dispatch passes for one rank.
///
/// Streams of a pass run concurrently on up to `threads` dedicated OS
/// threads, the caller's included. Operations may use rayon internally: no
/// operation ever runs on a work-stealing worker while it holds a device
/// primitive. Passes never overlap: a launch while another pass is draining
/// waits for it.
pub struct Dispatcher {
    pub(super) config: DispatchConfig,
    pub(super) threads: usize,
    /// Held for the whole of a pass.
    pub(super) gate: Mutex<()>,
    pub(super) metrics: Arc<RwLock<DispatchMetrics>>,
    pub(super) pass_counter: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        let threads = config.resolved_worker_threads();
        info!(threads, "dispatcher configured");
        Self {
            config,
            threads,
            gate: Mutex::new(()),
            metrics: Arc::new(RwLock::new(DispatchMetrics::default())),
            pass_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Upper bound on threads draining streams in one pass.
    pub fn worker_threads(&self) -> usize {
        self.threads
    }

    pub fn state(&self) -> DispatchState {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Passes started so far.
    pub fn passes(&self) -> u64 {
        self.pass_counter.load(Ordering::Relaxed)
    }

    /// Get a snapshot of the current dispatch metrics.
    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<DispatchMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Block until no pass is draining.
    pub fn wait_idle(&self) {
        drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub(super) fn set_state(&self, state: DispatchState) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("threads", &self.threads)
            .field("state", &self.state())
            .field("passes", &self.passes())
            .finish()
    }
}
