use std::collections::BTreeMap;
use std::path::Path;

use sgpu_core::{NodeConfig, ShareTieBreak, SharingPolicy, StaticPartition, SyncError};

use super::*;

fn config(dir: &Path, ranks: usize, devices: usize, policy: SharingPolicy) -> NodeConfig {
    NodeConfig {
        ranks_per_node: ranks,
        device_count: devices,
        policy,
        use_gpu_blas: true,
        use_gpu_conv: true,
        affinities: BTreeMap::new(),
        lock_dir: dir.to_path_buf(),
        lock_namespace: "test".into(),
        dispatch_threads: 0,
    }
}

#[test]
fn static_broker_opens_both_primitives_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 4, 2, SharingPolicy::Static(StaticPartition::RoundRobin));
    let broker = Broker::initialize(3, &cfg).unwrap();

    assert_eq!(broker.current_device(), 1);
    assert_eq!(broker.device_count(), 2);
    for device in 0..2 {
        for primitive in Primitive::ALL {
            let name = primitive_name("test", device, primitive);
            assert!(dir.path().join(format!("{name}.lock")).exists(), "{name} missing");
        }
    }
}

#[test]
fn lock_dir_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("node/locks");
    let cfg = config(&nested, 1, 1, SharingPolicy::Static(StaticPartition::RoundRobin));
    Broker::initialize(0, &cfg).unwrap();
    assert!(nested.is_dir());
}

#[test]
fn device_for_follows_static_table() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 6, 2, SharingPolicy::Static(StaticPartition::Block));
    let broker = Broker::initialize(0, &cfg).unwrap();
    let table: Vec<_> = (0..6).map(|r| broker.device_for(r).unwrap()).collect();
    assert_eq!(
        table,
        vec![Some(0), Some(0), Some(0), Some(1), Some(1), Some(1)]
    );
    assert_eq!(broker.device_for(6).unwrap(), None);
}

#[test]
fn unknown_device_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 2, 2, SharingPolicy::Static(StaticPartition::RoundRobin));
    let broker = Broker::initialize(0, &cfg).unwrap();
    let err = broker.acquire(2, Primitive::Compute).unwrap_err();
    assert!(matches!(
        err,
        SyncError::UnknownDevice {
            device: 2,
            device_count: 2
        }
    ));
}

#[test]
fn compute_excludes_compute_but_not_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 2, 1, SharingPolicy::Static(StaticPartition::RoundRobin));
    let a = Broker::initialize(0, &cfg).unwrap();
    let b = Broker::initialize(1, &cfg).unwrap();

    let held = a.acquire(0, Primitive::Compute).unwrap();
    assert_eq!(held.device(), 0);
    assert_eq!(held.primitive(), Primitive::Compute);
    assert!(b.try_acquire(0, Primitive::Compute).unwrap().is_none());
    assert!(b.try_acquire(0, Primitive::Transfer).unwrap().is_some());

    held.release();
    assert!(b.try_acquire(0, Primitive::Compute).unwrap().is_some());
}

#[test]
fn pack_needs_no_primitive() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 1, 1, SharingPolicy::Static(StaticPartition::RoundRobin));
    let broker = Broker::initialize(0, &cfg).unwrap();
    assert!(broker.acquire_for(0, OpCategory::Pack).unwrap().is_none());
    let guard = broker.acquire_for(0, OpCategory::Transfer).unwrap().unwrap();
    assert_eq!(guard.primitive(), Primitive::Transfer);
}

#[test]
fn shared_brokers_join_and_leave_registry() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 3, 2, SharingPolicy::Shared(ShareTieBreak::LeastLoaded));

    let a = Broker::initialize(0, &cfg).unwrap();
    let b = Broker::initialize(1, &cfg).unwrap();
    let c = Broker::initialize(2, &cfg).unwrap();
    assert_eq!(
        [a.current_device(), b.current_device(), c.current_device()],
        [0, 1, 0]
    );
    assert_eq!(a.device_for(1).unwrap(), Some(1));

    drop(b);
    assert_eq!(a.device_for(1).unwrap(), None);

    // the freed slot goes to the next joiner
    let d = Broker::initialize(1, &cfg).unwrap();
    assert_eq!(d.current_device(), 1);
    drop(c);
}
