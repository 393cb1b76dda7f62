//! Rank → device assignment rules.

use sgpu_core::{ShareTieBreak, StaticPartition};

/// Device of `rank` under a static partition.
///
/// A pure function of its arguments: the same inputs give the same device on
/// every run. `device_count` must be non-zero.
pub fn static_device(
    rank: usize,
    ranks_per_node: usize,
    device_count: usize,
    partition: StaticPartition,
) -> usize {
    match partition {
        StaticPartition::RoundRobin => rank % device_count,
        StaticPartition::Block => {
            let ranks = ranks_per_node.max(1);
            (rank * device_count / ranks).min(device_count - 1)
        }
    }
}

/// Full rank → device table for a static partition.
pub fn static_table(
    ranks_per_node: usize,
    device_count: usize,
    partition: StaticPartition,
) -> Vec<usize> {
    (0..ranks_per_node)
        .map(|rank| static_device(rank, ranks_per_node, device_count, partition))
        .collect()
}

/// Device a joining rank gets, given how many ranks each device already has.
pub fn shared_device(loads: &[usize], ranks_per_node: usize, tie_break: ShareTieBreak) -> usize {
    let least_loaded = || {
        loads
            .iter()
            .enumerate()
            .min_by_key(|(idx, load)| (**load, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    };
    match tie_break {
        ShareTieBreak::LeastLoaded => least_loaded(),
        ShareTieBreak::Packed => {
            let cap = ranks_per_node.div_ceil(loads.len().max(1)).max(1);
            loads
                .iter()
                .position(|&load| load < cap)
                .unwrap_or_else(least_loaded)
        }
    }
}
