mod loading;
mod types;


pub use loading::ENV_PREFIX;
pub use types::{NodeConfig, ShareTieBreak, SharingPolicy, StaticPartition};

/// Recognised configuration keys.
pub mod keys {
    pub const MPI_TASKS_PER_NODE: &str = "MPI_TASKS_PER_NODE";
    pub const NUM_GPU: &str = "NUM_GPU";
    pub const USE_SHARED: &str = "USE_SHARED";
    pub const USE_GPU_BLAS: &str = "USE_GPU_BLAS";
    pub const USE_GPU_CONV: &str = "USE_GPU_CONV";
    pub const GPU_CPUS_AFF_PREFIX: &str = "GPU_CPUS_AFF_";
    pub const STATIC_PARTITION: &str = "STATIC_PARTITION";
    pub const SHARE_TIE_BREAK: &str = "SHARE_TIE_BREAK";
    pub const LOCK_DIR: &str = "LOCK_DIR";
    pub const LOCK_NAMESPACE: &str = "LOCK_NAMESPACE";
    pub const DISPATCH_THREADS: &str = "DISPATCH_THREADS";

    const FIXED: &[&str] = &[
        MPI_TASKS_PER_NODE,
        NUM_GPU,
        USE_SHARED,
        USE_GPU_BLAS,
        USE_GPU_CONV,
        STATIC_PARTITION,
        SHARE_TIE_BREAK,
        LOCK_DIR,
        LOCK_NAMESPACE,
        DISPATCH_THREADS,
    ];

    pub(crate) fn is_known(key: &str) -> bool {
        FIXED.contains(&key) || key.starts_with(GPU_CPUS_AFF_PREFIX)
    }
}
