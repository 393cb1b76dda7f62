//! Per-rank record of device access, fixed at initialization.

use std::collections::HashSet;

use serde::Serialize;

/// Whether this rank takes the device path, and for what.
///
/// Built once by initialization; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    rank: usize,
    host: String,
    device: Option<usize>,
    gpu_conv: bool,
    gpu_blas: bool,
}

impl Attachment {
    pub(crate) fn attached(rank: usize, host: String, device: usize, gpu_conv: bool, gpu_blas: bool) -> Self {
        Self {
            rank,
            host,
            device: Some(device),
            gpu_conv,
            gpu_blas,
        }
    }

    pub(crate) fn cpu_only(rank: usize, host: String) -> Self {
        Self {
            rank,
            host,
            device: None,
            gpu_conv: false,
            gpu_blas: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Device this rank is attached to, `None` when running CPU-only.
    pub fn device(&self) -> Option<usize> {
        self.device
    }

    pub fn is_attached(&self) -> bool {
        self.device.is_some()
    }

    pub fn gpu_conv(&self) -> bool {
        self.gpu_conv
    }

    pub fn gpu_blas(&self) -> bool {
        self.gpu_blas
    }
}

/// Hardware self-test run on the assigned device before a rank attaches.
pub trait DeviceProbe: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn self_test(&self, device: usize) -> Result<(), String>;
}

/// Probe with no hardware behind it. Every device passes unless listed as
/// failing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedProbe {
    failing: HashSet<usize>,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(devices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing: devices.into_iter().collect(),
        }
    }
}

impl DeviceProbe for SimulatedProbe {
    fn self_test(&self, device: usize) -> Result<(), String> {
        if self.failing.contains(&device) {
            Err(format!("simulated self-test failure on device {device}"))
        } else {
            Ok(())
        }
    }
}

impl<P: DeviceProbe + ?Sized> DeviceProbe for &P {
    fn self_test(&self, device: usize) -> Result<(), String> {
        (**self).self_test(device)
    }
}
