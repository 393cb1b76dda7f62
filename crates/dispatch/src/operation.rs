//! Typed units of work queued on a stream.
//!
//! An [`Operation`] owns its closure and everything the closure captured, so
//! parameter blocks are never shared between concurrently running operations.
//! Each operation carries an [`OpTicket`], its private error output.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use sgpu_core::OpError;

/// Category of an operation. Decides which device primitive guards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCategory {
    /// Device-side computation.
    Compute,
    /// Host/device data movement.
    Transfer,
    /// Host-side packing into or out of staging buffers.
    Pack,
}

impl OpCategory {
    /// Primitive that must be held while an operation of this category runs.
    /// Packing touches only rank-private host memory and takes none.
    pub fn primitive(self) -> Option<Primitive> {
        match self {
            Self::Compute => Some(Primitive::Compute),
            Self::Transfer => Some(Primitive::Transfer),
            Self::Pack => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Transfer => "transfer",
            Self::Pack => "pack",
        }
    }
}

impl fmt::Display for OpCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two mutual-exclusion primitives every device owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Compute,
    Transfer,
}

impl Primitive {
    pub const ALL: [Primitive; 2] = [Primitive::Compute, Primitive::Transfer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Floating-point precision of transferred elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }
}

/// What an operation's closure sees while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    pub rank: usize,
    pub device: usize,
}

/// Boxed work of an operation.
pub type OpFn = Box<dyn FnOnce(&ExecContext) -> Result<(), OpError> + Send>;

/// A unit of work. Consumed exactly once by the dispatch loop.
pub struct Operation {
    pub(crate) category: OpCategory,
    pub(crate) label: String,
    pub(crate) bytes: usize,
    pub(crate) work: OpFn,
    pub(crate) ticket: OpTicket,
}

impl Operation {
    fn new(category: OpCategory, label: String, bytes: usize, work: OpFn) -> Self {
        Self {
            category,
            label,
            bytes,
            work,
            ticket: OpTicket::default(),
        }
    }

    /// Device-side computation, run under the device's compute primitive.
    pub fn compute<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&ExecContext) -> Result<(), OpError> + Send + 'static,
    {
        Self::new(OpCategory::Compute, label.into(), 0, Box::new(f))
    }

    /// Data movement of `bytes`, run under the device's transfer primitive.
    pub fn transfer<F>(label: impl Into<String>, bytes: usize, f: F) -> Self
    where
        F: FnOnce(&ExecContext) -> Result<(), OpError> + Send + 'static,
    {
        Self::new(OpCategory::Transfer, label.into(), bytes, Box::new(f))
    }

    /// Transfer of `count` elements at `precision`.
    ///
    /// A byte size that overflows `usize` cannot be allocated: the operation
    /// then fails with [`OpError::Alloc`] when dispatched, without running `f`.
    pub fn transfer_elements<F>(
        label: impl Into<String>,
        count: usize,
        precision: Precision,
        f: F,
    ) -> Self
    where
        F: FnOnce(&ExecContext) -> Result<(), OpError> + Send + 'static,
    {
        match count.checked_mul(precision.element_size()) {
            Some(bytes) => Self::transfer(label, bytes, f),
            None => Self::transfer(label, usize::MAX, move |_: &ExecContext| {
                Err(OpError::Alloc(format!(
                    "{count} {precision:?} elements exceed the addressable size"
                )))
            }),
        }
    }

    /// Host-side packing; needs no device primitive.
    pub fn pack<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&ExecContext) -> Result<(), OpError> + Send + 'static,
    {
        Self::new(OpCategory::Pack, label.into(), 0, Box::new(f))
    }

    pub fn category(&self) -> OpCategory {
        self.category
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes moved (transfers only; 0 otherwise).
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Handle to this operation's outcome, readable after the drain.
    pub fn ticket(&self) -> OpTicket {
        self.ticket.clone()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("category", &self.category)
            .field("label", &self.label)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

// ── Ticket ──────────────────────────────────────────────────────────

/// Code reported by a ticket whose operation has not run yet.
pub const PENDING: i32 = -1;

/// Write-once outcome of one operation.
#[derive(Debug, Clone, Default)]
pub struct OpTicket(Arc<OnceLock<Result<(), OpError>>>);

impl OpTicket {
    pub fn is_complete(&self) -> bool {
        self.0.get().is_some()
    }

    /// Outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<(), OpError>> {
        self.0.get().cloned()
    }

    /// Integer outcome: 0 success, [`PENDING`] while pending, otherwise
    /// [`OpError::code`].
    pub fn code(&self) -> i32 {
        match self.0.get() {
            None => PENDING,
            Some(Ok(())) => 0,
            Some(Err(e)) => e.code(),
        }
    }

    pub(crate) fn complete(&self, outcome: Result<(), OpError>) {
        if self.0.set(outcome).is_err() {
            tracing::warn!("operation ticket completed twice; keeping first outcome");
        }
    }
}
