//! Node-local queue of streams awaiting dispatch.
//!
//! Registration appends under a mutex. A dispatch pass takes a snapshot of
//! everything registered so far; streams registered while the pass runs wait
//! for the next one. Drained streams stay counted until released.

use std::sync::{Mutex, MutexGuard};

use crate::error::DispatchError;
use crate::stream::Stream;

#[derive(Debug, Default)]
struct QueueInner {
    pending: Vec<Stream>,
    draining: Vec<Stream>,
}

/// Streams pending dispatch, in registration order.
///
/// Outside this crate a queue is only registered into and counted. Passes
/// are taken and released by [`Dispatcher::launch_all`](crate::Dispatcher::launch_all):
///
/// ```compile_fail
/// let queue = sgpu_dispatch::StreamQueue::new();
/// let _ = queue.begin_pass();
/// ```
///
/// ```compile_fail
/// let queue = sgpu_dispatch::StreamQueue::new();
/// let _ = queue.release_drained();
/// ```
#[derive(Debug, Default)]
pub struct StreamQueue {
    inner: Mutex<QueueInner>,
}

impl StreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stream. Safe to call from several threads at once.
    pub fn register(&self, stream: Stream) -> Result<(), DispatchError> {
        let mut inner = self.lock()?;
        tracing::trace!(stream = %stream.id(), device = stream.device(), "stream registered");
        inner.pending.push(stream);
        Ok(())
    }

    /// Snapshot the pending streams for a pass, in registration order.
    ///
    /// The snapshot moves to the draining set, where it stays until
    /// [`release_drained`](Self::release_drained).
    pub(crate) fn begin_pass(&self) -> Result<Vec<Stream>, DispatchError> {
        let mut inner = self.lock()?;
        let snapshot = std::mem::take(&mut inner.pending);
        inner.draining.extend(snapshot.iter().cloned());
        Ok(snapshot)
    }

    /// Release every stream of the finished pass. Returns how many.
    pub(crate) fn release_drained(&self) -> Result<usize, DispatchError> {
        let drained = std::mem::take(&mut self.lock()?.draining);
        for stream in &drained {
            stream.release();
        }
        Ok(drained.len())
    }

    /// Release everything, pending streams included. Used at teardown.
    pub(crate) fn release_all(&self) -> usize {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        let mut released = 0;
        for stream in inner.pending.drain(..).chain(inner.draining.drain(..)) {
            stream.release();
            released += 1;
        }
        released
    }

    /// Streams waiting for the next pass.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    /// Streams taken by a pass and not yet released.
    pub fn draining_len(&self) -> usize {
        self.lock().map(|i| i.draining.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock()
            .map(|i| i.pending.len() + i.draining.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>, DispatchError> {
        self.inner
            .lock()
            .map_err(|e| DispatchError::Poisoned(format!("stream queue: {e}")))
    }
}
