//! Ordered operation sequences bound to one device.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::operation::{OpTicket, Operation};

/// Lifecycle of a stream: `Open → Draining → Drained → Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Accepting operations, waiting for the next pass.
    Open,
    /// Taken by a dispatch pass; operations are executing.
    Draining,
    /// Every operation has run; waiting for release.
    Drained,
    /// Dropped from the queue. Any further use is a caller bug.
    Released,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Drained => "drained",
            Self::Released => "released",
        }
    }
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    ops: Vec<Operation>,
}

/// Handle to a stream. Clones refer to the same stream.
///
/// Operations run in append order; a stream is never reordered.
#[derive(Debug, Clone)]
pub struct Stream {
    id: Uuid,
    device: usize,
    inner: Arc<Mutex<StreamInner>>,
}

impl Stream {
    pub(crate) fn new(device: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            inner: Arc::new(Mutex::new(StreamInner {
                state: StreamState::Open,
                ops: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Device every operation of this stream runs on.
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn state(&self) -> StreamState {
        self.lock_recovering().state
    }

    /// Operations appended but not yet taken by a pass.
    pub fn pending_ops(&self) -> usize {
        self.lock_recovering().ops.len()
    }

    /// Append `op` to the tail. Returns the operation's ticket.
    pub fn add_operation(&self, op: Operation) -> Result<OpTicket, DispatchError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| DispatchError::Poisoned(format!("stream {}: {}", self.id, e)))?;
        if inner.state != StreamState::Open {
            return Err(DispatchError::StreamClosed {
                id: self.id,
                state: inner.state.as_str(),
            });
        }
        let ticket = op.ticket();
        inner.ops.push(op);
        Ok(ticket)
    }

    /// Move to `Draining` and hand over the operations, in order.
    pub(crate) fn begin_drain(&self) -> Result<Vec<Operation>, DispatchError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| DispatchError::Poisoned(format!("stream {}: {}", self.id, e)))?;
        if inner.state != StreamState::Open {
            return Err(DispatchError::StreamClosed {
                id: self.id,
                state: inner.state.as_str(),
            });
        }
        inner.state = StreamState::Draining;
        Ok(std::mem::take(&mut inner.ops))
    }

    pub(crate) fn finish_drain(&self) {
        self.lock_recovering().state = StreamState::Drained;
    }

    pub(crate) fn release(&self) {
        let mut inner = self.lock_recovering();
        inner.state = StreamState::Released;
        inner.ops.clear();
    }

    fn lock_recovering(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
