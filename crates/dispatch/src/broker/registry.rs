//! File-backed registry of ranks sharing a node's devices.
//!
//! One line per member, `rank device pid`, guarded by its own named lock.
//! Members whose process is gone are pruned whenever a rank joins, so a
//! crashed rank does not keep counting against a device.

use std::path::{Path, PathBuf};

use sgpu_core::{ShareTieBreak, SyncError};

use super::assignment::shared_device;
use super::ipc_lock::NamedLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub rank: usize,
    pub device: usize,
    pub pid: u32,
}

#[derive(Debug)]
pub struct ShareRegistry {
    path: PathBuf,
    lock: NamedLock,
}

impl ShareRegistry {
    pub fn open(dir: &Path, namespace: &str) -> Result<Self, SyncError> {
        let lock = NamedLock::create(dir, &format!("{namespace}-registry"))?;
        Ok(Self {
            path: dir.join(format!("{namespace}.registry")),
            lock,
        })
    }

    /// Join as `rank` and return the device it should use.
    ///
    /// A rank already registered keeps its device.
    pub fn join(
        &self,
        rank: usize,
        ranks_per_node: usize,
        device_count: usize,
        tie_break: ShareTieBreak,
    ) -> Result<usize, SyncError> {
        let _guard = self.lock.acquire()?;
        let mut members = self.read_members()?;
        let before = members.len();
        members.retain(|m| process_alive(m.pid));
        if members.len() != before {
            tracing::info!(pruned = before - members.len(), "pruned dead share-registry members");
        }

        let device = match members.iter().find(|m| m.rank == rank) {
            Some(existing) if existing.device < device_count => existing.device,
            _ => {
                let mut loads = vec![0usize; device_count];
                for m in members.iter().filter(|m| m.rank != rank) {
                    if let Some(load) = loads.get_mut(m.device) {
                        *load += 1;
                    }
                }
                shared_device(&loads, ranks_per_node, tie_break)
            }
        };

        members.retain(|m| m.rank != rank);
        members.push(Member {
            rank,
            device,
            pid: std::process::id(),
        });
        self.write_members(&members)?;
        Ok(device)
    }

    /// Remove `rank` from the registry.
    pub fn leave(&self, rank: usize) -> Result<(), SyncError> {
        let _guard = self.lock.acquire()?;
        let mut members = self.read_members()?;
        members.retain(|m| m.rank != rank);
        self.write_members(&members)
    }

    /// Current members, in join order.
    pub fn members(&self) -> Result<Vec<Member>, SyncError> {
        let _guard = self.lock.acquire()?;
        self.read_members()
    }

    fn read_members(&self) -> Result<Vec<Member>, SyncError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::Registry(format!("{}: {e}", self.path.display()))),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_member)
            .collect()
    }

    fn write_members(&self, members: &[Member]) -> Result<(), SyncError> {
        let body: String = members
            .iter()
            .map(|m| format!("{} {} {}\n", m.rank, m.device, m.pid))
            .collect();
        std::fs::write(&self.path, body)
            .map_err(|e| SyncError::Registry(format!("{}: {e}", self.path.display())))
    }
}

fn parse_member(line: &str) -> Result<Member, SyncError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let bad = || SyncError::Registry(format!("malformed registry line: {line:?}"));
    match fields.as_slice() {
        [rank, device, pid] => Ok(Member {
            rank: rank.parse().map_err(|_| bad())?,
            device: device.parse().map_err(|_| bad())?,
            pid: pid.parse().map_err(|_| bad())?,
        }),
        _ => Err(bad()),
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_loaded_spreads_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ShareRegistry::open(dir.path(), "t").unwrap();
        let devices: Vec<usize> = (0..4)
            .map(|rank| reg.join(rank, 4, 2, ShareTieBreak::LeastLoaded).unwrap())
            .collect();
        assert_eq!(devices, vec![0, 1, 0, 1]);
        assert_eq!(reg.members().unwrap().len(), 4);
    }

    #[test]
    fn packed_fills_first_device() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ShareRegistry::open(dir.path(), "t").unwrap();
        let devices: Vec<usize> = (0..4)
            .map(|rank| reg.join(rank, 4, 2, ShareTieBreak::Packed).unwrap())
            .collect();
        assert_eq!(devices, vec![0, 0, 1, 1]);
    }

    #[test]
    fn rejoin_keeps_device_and_leave_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ShareRegistry::open(dir.path(), "t").unwrap();
        assert_eq!(reg.join(0, 2, 2, ShareTieBreak::LeastLoaded).unwrap(), 0);
        assert_eq!(reg.join(1, 2, 2, ShareTieBreak::LeastLoaded).unwrap(), 1);
        assert_eq!(reg.join(1, 2, 2, ShareTieBreak::LeastLoaded).unwrap(), 1);

        reg.leave(0).unwrap();
        let members = reg.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].rank, 1);
    }

    #[test]
    fn dead_members_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ShareRegistry::open(dir.path(), "t").unwrap();
        // pid beyond any real pid_max
        std::fs::write(dir.path().join("t.registry"), "5 0 2147483000\n").unwrap();
        assert_eq!(reg.join(0, 2, 2, ShareTieBreak::LeastLoaded).unwrap(), 0);
        let ranks: Vec<usize> = reg.members().unwrap().iter().map(|m| m.rank).collect();
        assert_eq!(ranks, vec![0]);
    }

    #[test]
    fn malformed_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ShareRegistry::open(dir.path(), "t").unwrap();
        std::fs::write(dir.path().join("t.registry"), "garbage\n").unwrap();
        assert!(matches!(reg.members(), Err(SyncError::Registry(_))));
    }
}
