use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Failures while reading the node configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("required key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("rank {rank} out of range for {ranks_per_node} ranks per node")]
    RankOutOfRange { rank: usize, ranks_per_node: usize },

    #[error("configuration parse error: {0}")]
    Parse(String),

    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the inter-process arbitration primitives.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("cannot create lock directory {}: {source}", path.display())]
    LockDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot create primitive {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    #[error("cannot acquire primitive {name}: {source}")]
    Acquire {
        name: String,
        source: std::io::Error,
    },

    #[error("no primitives for device {device} ({device_count} devices on node)")]
    UnknownDevice { device: usize, device_count: usize },

    #[error("share registry error: {0}")]
    Registry(String),

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

/// Device self-test failure, tagged with the host it happened on.
#[derive(Error, Debug, Clone)]
#[error("device {device} failed self-test on host {host} (rank {rank}): {reason}")]
pub struct HardwareError {
    pub host: String,
    pub rank: usize,
    pub device: usize,
    pub reason: String,
}

/// Per-operation failure. Reported through the operation's ticket and never
/// unwinds the dispatch loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("allocation failed: {0}")]
    Alloc(String),

    #[error("compute failed: {0}")]
    Compute(String),

    #[error("arbitration failed: {0}")]
    Sync(String),

    #[error("skipped after an earlier failure in the same stream")]
    Skipped,
}

impl OpError {
    /// Integer code handed back across the numerical-engine boundary.
    /// Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::Transfer(_) => 1,
            Self::Alloc(_) => 2,
            Self::Compute(_) => 3,
            Self::Sync(_) => 4,
            Self::Skipped => 5,
        }
    }
}

impl From<SyncError> for OpError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e.to_string())
    }
}

/// Stage of device-path setup at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStage {
    Config,
    SyncInit,
    HardwareCheck,
}

impl std::fmt::Display for InitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::SyncInit => "sync-init",
            Self::HardwareCheck => "hardware-check",
        };
        f.write_str(s)
    }
}

/// Any failure that disables the device path for a rank.
#[derive(Error, Debug)]
pub enum SharingError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("sync-init: {0}")]
    Sync(#[from] SyncError),

    #[error("hardware-check: {0}")]
    Hardware(#[from] HardwareError),
}

impl SharingError {
    pub fn stage(&self) -> InitStage {
        match self {
            Self::Config(_) => InitStage::Config,
            Self::Sync(_) => InitStage::SyncInit,
            Self::Hardware(_) => InitStage::HardwareCheck,
        }
    }
}
