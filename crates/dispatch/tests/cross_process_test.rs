//! Several `sgpu-rank` processes against one lock directory.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use serde_json::Value;
use tempfile::TempDir;

const RANK_BIN: &str = env!("CARGO_BIN_EXE_sgpu-rank");
const LAUNCHER_BIN: &str = env!("CARGO_BIN_EXE_sgpu-launcher");

#[derive(Debug, Clone)]
struct TraceLine {
    rank: usize,
    device: usize,
    stream: usize,
    seq: usize,
    category: String,
    start: i64,
    end: i64,
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("sgpu.conf");
    let content = format!(
        "LOCK_DIR={}\nLOCK_NAMESPACE=xp\n{body}",
        dir.path().join("locks").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

/// A command whose environment carries no `SGPU_*` overrides.
fn command(bin: &str) -> Command {
    let mut cmd = Command::new(bin);
    for (name, _) in std::env::vars().filter(|(n, _)| n.starts_with("SGPU_")) {
        cmd.env_remove(name);
    }
    cmd
}

fn spawn_rank(rank: usize, config: &Path, trace: &Path, extra: &[&str]) -> Child {
    command(RANK_BIN)
        .arg("--rank")
        .arg(rank.to_string())
        .arg("--config")
        .arg(config)
        .arg("--trace")
        .arg(trace)
        .args(extra)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap()
}

fn finish(child: Child) -> Value {
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success(), "rank exited with {:?}", out.status);
    let stdout = String::from_utf8(out.stdout).unwrap();
    serde_json::from_str(stdout.trim()).unwrap()
}

fn read_trace(path: &Path) -> Vec<TraceLine> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    content
        .lines()
        .map(|line| {
            let f: Vec<&str> = line.split_whitespace().collect();
            assert_eq!(f.len(), 7, "bad trace line {line:?}");
            TraceLine {
                rank: f[0].parse().unwrap(),
                device: f[1].parse().unwrap(),
                stream: f[2].parse().unwrap(),
                seq: f[3].parse().unwrap(),
                category: f[4].to_string(),
                start: f[5].parse().unwrap(),
                end: f[6].parse().unwrap(),
            }
        })
        .collect()
}

/// No two intervals of `category` on one device overlap.
fn assert_exclusive(trace: &[TraceLine], category: &str) {
    let mut by_device: HashMap<usize, Vec<&TraceLine>> = HashMap::new();
    for t in trace.iter().filter(|t| t.category == category) {
        by_device.entry(t.device).or_default().push(t);
    }
    for (device, mut spans) in by_device {
        spans.sort_by_key(|t| t.start);
        for pair in spans.windows(2) {
            assert!(
                pair[0].end <= pair[1].start,
                "{category} overlap on device {device}: {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }
}

fn assert_in_stream_order(trace: &[TraceLine]) {
    let mut streams: HashMap<(usize, usize), Vec<&TraceLine>> = HashMap::new();
    for t in trace {
        streams.entry((t.rank, t.stream)).or_default().push(t);
    }
    for ((rank, stream), mut ops) in streams {
        ops.sort_by_key(|t| t.start);
        let seqs: Vec<usize> = ops.iter().map(|t| t.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "rank {rank} stream {stream} ran out of order");
    }
}

#[test]
fn two_ranks_on_one_device_never_overlap_compute() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=1\nUSE_GPU_CONV=1\n");
    let trace = dir.path().join("trace");
    let args = ["--streams", "3", "--compute-ms", "15", "--transfer-ms", "5"];

    let children: Vec<Child> = (0..2)
        .map(|rank| spawn_rank(rank, &config, &trace, &args))
        .collect();
    let outputs: Vec<Value> = children.into_iter().map(finish).collect();

    for out in &outputs {
        assert_eq!(out["init"]["attached"], Value::Bool(true));
        assert_eq!(out["init"]["device"], 0);
        assert_eq!(out["drains"][0]["failed"], 0);
    }

    let trace = read_trace(&trace);
    // 2 ranks x 3 streams x 4 operations
    assert_eq!(trace.len(), 24);
    assert!(trace.iter().all(|t| t.device == 0));
    assert_exclusive(&trace, "compute");
    assert_exclusive(&trace, "transfer");
    assert_in_stream_order(&trace);
}

#[test]
fn shared_policy_ranks_keep_exclusion_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        "MPI_TASKS_PER_NODE=3\nNUM_GPU=2\nUSE_SHARED=1\nUSE_GPU_BLAS=1\n",
    );
    let trace = dir.path().join("trace");
    let args = ["--streams", "2", "--compute-ms", "10", "--transfer-ms", "2"];

    let children: Vec<Child> = (0..3)
        .map(|rank| spawn_rank(rank, &config, &trace, &args))
        .collect();
    let outputs: Vec<Value> = children.into_iter().map(finish).collect();
    for out in &outputs {
        assert_eq!(out["init"]["attached"], Value::Bool(true));
        assert_eq!(out["init"]["gpu_blas"], Value::Bool(true));
    }

    let trace = read_trace(&trace);
    assert_eq!(trace.len(), 24);
    assert_exclusive(&trace, "compute");
    assert_exclusive(&trace, "transfer");
    assert_in_stream_order(&trace);

    // every rank left the registry on shutdown
    let registry = std::fs::read_to_string(dir.path().join("locks/xp.registry")).unwrap();
    assert!(registry.trim().is_empty(), "registry not emptied: {registry:?}");
}

#[test]
fn failed_self_test_disables_only_that_rank() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=1\nUSE_GPU_CONV=1\n");
    let trace = dir.path().join("trace");

    let healthy = spawn_rank(0, &config, &trace, &["--streams", "1"]);
    let broken = spawn_rank(1, &config, &trace, &["--streams", "1", "--fail-self-test", "0"]);
    let healthy = finish(healthy);
    let broken = finish(broken);

    assert_eq!(healthy["init"]["attached"], Value::Bool(true));
    assert_eq!(healthy["init"]["error_code"], 0);

    assert_eq!(broken["init"]["attached"], Value::Bool(false));
    assert_eq!(broken["init"]["error_code"], 3);
    assert_eq!(broken["init"]["stage"], "hardware-check");
    assert!(broken["drains"].as_array().unwrap().is_empty());

    let trace = read_trace(&trace);
    assert_eq!(trace.len(), 4);
    assert!(trace.iter().all(|t| t.rank == 0));
}

#[test]
fn missing_config_runs_cpu_only() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace");
    let out = finish(spawn_rank(0, &dir.path().join("absent.conf"), &trace, &[]));

    assert_eq!(out["init"]["attached"], Value::Bool(false));
    assert_eq!(out["init"]["stage"], "config");
    assert_eq!(out["init"]["error_code"], 1);
    assert!(read_trace(&trace).is_empty());
}

#[test]
fn launcher_forwards_every_rank_summary() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "MPI_TASKS_PER_NODE=4\nNUM_GPU=1\nUSE_GPU_CONV=1\n");

    for _ in 0..5 {
        let out = command(LAUNCHER_BIN)
            .arg("--config")
            .arg(&config)
            .arg("--rank-bin")
            .arg(RANK_BIN)
            .args(["--", "--streams", "1", "--compute-ms", "2", "--transfer-ms", "1"])
            .env("RUST_LOG", "warn")
            .stderr(Stdio::inherit())
            .output()
            .unwrap();
        assert!(out.status.success(), "launcher exited with {:?}", out.status);

        let stdout = String::from_utf8(out.stdout).unwrap();
        let mut ranks: Vec<u64> = stdout
            .lines()
            .filter_map(|line| line.split_once(" │ ").map(|(_, body)| body))
            .filter_map(|body| serde_json::from_str::<Value>(body).ok())
            .filter_map(|json| json["init"]["rank"].as_u64())
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3], "launcher output:\n{stdout}");
    }
}
