use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Node config ─────────────────────────────────────────────────────

/// Node-wide GPU sharing configuration.
///
/// Parsed from a line-oriented `KEY=value` file, with `SGPU_<KEY>`
/// environment overrides. Every rank on a node reads the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `MPI_TASKS_PER_NODE`: ranks sharing this node.
    pub ranks_per_node: usize,

    /// `NUM_GPU`: physical devices on this node.
    pub device_count: usize,

    /// `USE_SHARED` selects [`SharingPolicy::Shared`].
    pub policy: SharingPolicy,

    /// `USE_GPU_BLAS`: device-accelerated linear algebra.
    pub use_gpu_blas: bool,

    /// `USE_GPU_CONV`: device-accelerated convolutions.
    pub use_gpu_conv: bool,

    /// `GPU_CPUS_AFF_<i>`: affinity string per device, passed through as-is.
    #[serde(default)]
    pub affinities: BTreeMap<usize, String>,

    /// `LOCK_DIR`: where the named arbitration primitives live.
    pub lock_dir: PathBuf,

    /// `LOCK_NAMESPACE`: prefix of every primitive name, so that unrelated
    /// jobs on one node do not contend.
    pub lock_namespace: String,

    /// `DISPATCH_THREADS`: stream workers per rank. 0 = available parallelism.
    pub dispatch_threads: usize,
}

impl NodeConfig {
    /// Whether any device-accelerated path is requested at all.
    pub fn wants_device(&self) -> bool {
        self.use_gpu_blas || self.use_gpu_conv
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.policy, SharingPolicy::Shared(_))
    }

    /// Affinity string configured for `device`, if any.
    pub fn affinity_for(&self, device: usize) -> Option<&str> {
        self.affinities.get(&device).map(String::as_str)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            ranks_per_node = self.ranks_per_node,
            device_count = self.device_count,
            policy = %self.policy,
            gpu_blas = self.use_gpu_blas,
            gpu_conv = self.use_gpu_conv,
            lock_dir = %self.lock_dir.display(),
            namespace = %self.lock_namespace,
            "node config loaded"
        );
        for (device, aff) in &self.affinities {
            tracing::debug!(device, affinity = %aff, "device affinity");
        }
    }
}

// ── Policies ────────────────────────────────────────────────────────

/// How ranks are mapped onto devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "strategy", rename_all = "kebab-case")]
pub enum SharingPolicy {
    /// Deterministic partition, a pure function of (rank, ranks, devices).
    Static(StaticPartition),
    /// Ranks join a node-wide registry; the tie-break picks the device.
    Shared(ShareTieBreak),
}

impl std::fmt::Display for SharingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(p) => write!(f, "static/{p}"),
            Self::Shared(t) => write!(f, "shared/{t}"),
        }
    }
}

/// Static partition strategy (`STATIC_PARTITION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaticPartition {
    /// `rank mod devices`.
    #[default]
    RoundRobin,
    /// Contiguous balanced blocks: `rank * devices / ranks`.
    Block,
}

/// Device choice for a rank joining the share registry (`SHARE_TIE_BREAK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShareTieBreak {
    /// Device with the fewest current members; ties go to the lowest index.
    #[default]
    LeastLoaded,
    /// Fill the lowest device up to `ceil(ranks / devices)` members first.
    Packed,
}

impl FromStr for StaticPartition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "modulo" => Ok(Self::RoundRobin),
            "block" => Ok(Self::Block),
            other => Err(format!("expected 'round-robin' or 'block', got '{other}'")),
        }
    }
}

impl std::fmt::Display for StaticPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round-robin",
            Self::Block => "block",
        })
    }
}

impl FromStr for ShareTieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "least-loaded" | "leastloaded" => Ok(Self::LeastLoaded),
            "packed" => Ok(Self::Packed),
            other => Err(format!("expected 'least-loaded' or 'packed', got '{other}'")),
        }
    }
}

impl std::fmt::Display for ShareTieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LeastLoaded => "least-loaded",
            Self::Packed => "packed",
        })
    }
}
