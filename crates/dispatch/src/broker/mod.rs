//! Device arbitration broker.
//!
//! Maps this node's ranks onto devices and owns, for every device, two named
//! inter-process primitives: one serializing COMPUTE operations and one
//! serializing TRANSFER operations. The two are independent, so a rank may
//! compute on a device while another transfers to it.

pub mod assignment;
pub mod ipc_lock;
pub mod registry;

use std::path::Path;
use std::time::{Duration, Instant};

use sgpu_core::{NodeConfig, SharingPolicy, SyncError};

use crate::operation::{OpCategory, Primitive};

pub use assignment::{shared_device, static_device, static_table};
pub use ipc_lock::{NamedLock, NamedLockGuard};
pub use registry::{Member, ShareRegistry};

#[derive(Debug)]
struct DevicePrimitives {
    compute: NamedLock,
    transfer: NamedLock,
}

impl DevicePrimitives {
    fn create(dir: &Path, namespace: &str, device: usize) -> Result<Self, SyncError> {
        Ok(Self {
            compute: NamedLock::create(dir, &primitive_name(namespace, device, Primitive::Compute))?,
            transfer: NamedLock::create(dir, &primitive_name(namespace, device, Primitive::Transfer))?,
        })
    }

    fn get(&self, primitive: Primitive) -> &NamedLock {
        match primitive {
            Primitive::Compute => &self.compute,
            Primitive::Transfer => &self.transfer,
        }
    }
}

/// Name of the primitive guarding `primitive` work on `device`.
pub fn primitive_name(namespace: &str, device: usize, primitive: Primitive) -> String {
    format!("{namespace}-gpu{device}-{primitive}")
}

/// Per-rank view of the node's device arbitration.
#[derive(Debug)]
pub struct Broker {
    rank: usize,
    device: usize,
    ranks_per_node: usize,
    policy: SharingPolicy,
    primitives: Vec<DevicePrimitives>,
    registry: Option<ShareRegistry>,
}

impl Broker {
    /// Build the rank → device assignment and open every device's primitives.
    ///
    /// On failure, primitives opened so far are closed before returning.
    pub fn initialize(rank: usize, config: &NodeConfig) -> Result<Self, SyncError> {
        let dir = config.lock_dir.as_path();
        std::fs::create_dir_all(dir).map_err(|source| SyncError::LockDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let primitives = (0..config.device_count)
            .map(|device| DevicePrimitives::create(dir, &config.lock_namespace, device))
            .collect::<Result<Vec<_>, _>>()?;

        let (device, registry) = match config.policy {
            SharingPolicy::Static(partition) => (
                static_device(rank, config.ranks_per_node, config.device_count, partition),
                None,
            ),
            SharingPolicy::Shared(tie_break) => {
                let registry = ShareRegistry::open(dir, &config.lock_namespace)?;
                let device =
                    registry.join(rank, config.ranks_per_node, config.device_count, tie_break)?;
                (device, Some(registry))
            }
        };

        tracing::info!(
            rank,
            device,
            devices = config.device_count,
            policy = %config.policy,
            "device arbitration initialized"
        );

        Ok(Self {
            rank,
            device,
            ranks_per_node: config.ranks_per_node,
            policy: config.policy,
            primitives,
            registry,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Device this rank submits streams to.
    pub fn current_device(&self) -> usize {
        self.device
    }

    pub fn device_count(&self) -> usize {
        self.primitives.len()
    }

    pub fn policy(&self) -> SharingPolicy {
        self.policy
    }

    /// Device assigned to `rank`, as far as this node knows.
    ///
    /// Static policies answer for any local rank; shared policies answer for
    /// ranks currently in the registry.
    pub fn device_for(&self, rank: usize) -> Result<Option<usize>, SyncError> {
        match self.policy {
            SharingPolicy::Static(partition) => {
                if rank >= self.ranks_per_node {
                    return Ok(None);
                }
                Ok(Some(static_device(
                    rank,
                    self.ranks_per_node,
                    self.device_count(),
                    partition,
                )))
            }
            SharingPolicy::Shared(_) => {
                let Some(registry) = &self.registry else {
                    return Ok(None);
                };
                Ok(registry
                    .members()?
                    .into_iter()
                    .find(|m| m.rank == rank)
                    .map(|m| m.device))
            }
        }
    }

    /// Block until `primitive` of `device` is free, then hold it.
    pub fn acquire(&self, device: usize, primitive: Primitive) -> Result<BrokerGuard<'_>, SyncError> {
        let lock = self.lock_for(device, primitive)?;
        let start = Instant::now();
        let guard = lock.acquire()?;
        let waited = start.elapsed();
        tracing::trace!(rank = self.rank, device, %primitive, ?waited, "primitive acquired");
        Ok(BrokerGuard {
            device,
            primitive,
            waited,
            _guard: guard,
        })
    }

    /// Hold `primitive` of `device` only if it is free right now.
    pub fn try_acquire(
        &self,
        device: usize,
        primitive: Primitive,
    ) -> Result<Option<BrokerGuard<'_>>, SyncError> {
        let lock = self.lock_for(device, primitive)?;
        Ok(lock.try_acquire()?.map(|guard| BrokerGuard {
            device,
            primitive,
            waited: Duration::ZERO,
            _guard: guard,
        }))
    }

    /// Acquire whatever primitive an operation of `category` needs, if any.
    pub fn acquire_for(
        &self,
        device: usize,
        category: OpCategory,
    ) -> Result<Option<BrokerGuard<'_>>, SyncError> {
        category
            .primitive()
            .map(|p| self.acquire(device, p))
            .transpose()
    }

    fn lock_for(&self, device: usize, primitive: Primitive) -> Result<&NamedLock, SyncError> {
        self.primitives
            .get(device)
            .map(|p| p.get(primitive))
            .ok_or(SyncError::UnknownDevice {
                device,
                device_count: self.primitives.len(),
            })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.leave(self.rank) {
                tracing::warn!(rank = self.rank, error = %e, "failed to leave share registry");
            }
        }
    }
}

/// A held device primitive. Dropping it (or calling
/// [`release`](Self::release)) frees it for other ranks.
#[derive(Debug)]
pub struct BrokerGuard<'a> {
    device: usize,
    primitive: Primitive,
    waited: Duration,
    _guard: NamedLockGuard<'a>,
}

impl BrokerGuard<'_> {
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    /// How long acquisition blocked.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn release(self) {}
}

#[cfg(test)]
mod tests;
