//! sgpu-launcher — spawns every rank of a node with prefixed output.
//!
//! Reads the node config for `MPI_TASKS_PER_NODE`, starts that many
//! `sgpu-rank` children, streams their output with a `rank N │` prefix, and
//! exits non-zero if any rank fails.
//!
//! # Usage
//!
//! ```bash
//! sgpu-launcher --config sgpu.conf -- --streams 4 --compute-ms 50
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use sgpu_core::NodeConfig;

/// Launch all ranks of one node.
#[derive(Parser, Debug)]
#[command(name = "sgpu-launcher", version, about)]
struct Cli {
    /// Node configuration file, passed on to every rank.
    #[arg(long, env = "SGPU_CONFIG", default_value = "sgpu.conf")]
    config: PathBuf,

    /// Number of ranks to start (default: MPI_TASKS_PER_NODE).
    #[arg(long)]
    ranks: Option<usize>,

    /// Path of the rank binary (default: `sgpu-rank` next to this executable).
    #[arg(long)]
    rank_bin: Option<PathBuf>,

    /// Extra arguments for every rank.
    #[arg(last = true)]
    rank_args: Vec<String>,
}

const COLORS: &[&str] = &[
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[91m", // bright red
];
const RESET: &str = "\x1b[0m";

struct ManagedChild {
    rank: usize,
    child: Child,
    /// Line forwarders for stdout and stderr; finish at EOF.
    pipes: Vec<JoinHandle<()>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ranks = match cli.ranks {
        Some(n) => n,
        None => NodeConfig::from_file(&cli.config)?.ranks_per_node,
    };
    let rank_bin = match cli.rank_bin {
        Some(p) => p,
        None => sibling_binary("sgpu-rank")?,
    };
    anyhow::ensure!(ranks > 0, "nothing to launch: 0 ranks");

    let width = format!("rank {}", ranks - 1).len();
    let mut children = Vec::with_capacity(ranks);
    for rank in 0..ranks {
        tracing::info!(rank, binary = %rank_bin.display(), "spawning rank");
        children.push(spawn_rank(&rank_bin, rank, &cli.config, &cli.rank_args, width)?);
    }
    tracing::info!(total = children.len(), "all ranks started");

    let failed = tokio::select! {
        failed = wait_all(&mut children) => failed?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; stopping ranks");
            for managed in children.iter_mut() {
                let _ = managed.child.kill().await;
            }
            anyhow::bail!("interrupted");
        }
    };

    if failed.is_empty() {
        tracing::info!(ranks, "all ranks finished");
        Ok(())
    } else {
        anyhow::bail!("ranks failed: {failed:?}")
    }
}

/// Spawn one rank and pipe its stdout/stderr through prefixed lines.
fn spawn_rank(
    bin: &Path,
    rank: usize,
    config: &Path,
    extra: &[String],
    width: usize,
) -> anyhow::Result<ManagedChild> {
    let mut cmd = Command::new(bin);
    cmd.arg("--rank")
        .arg(rank.to_string())
        .arg("--config")
        .arg(config)
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let color = COLORS[rank % COLORS.len()];
    let prefix = format!("{color}{:>width$}{RESET} │ ", format!("rank {rank}"));

    let mut pipes = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let prefix = prefix.clone();
        pipes.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("{prefix}{line}");
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        pipes.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{prefix}{line}");
            }
        }));
    }
    Ok(ManagedChild { rank, child, pipes })
}

/// Wait for every child and for its output to be forwarded to the end.
/// Returns the ranks that exited unsuccessfully.
async fn wait_all(children: &mut [ManagedChild]) -> anyhow::Result<Vec<usize>> {
    let mut failed = Vec::new();
    for managed in children.iter_mut() {
        let status = managed.child.wait().await?;
        for pipe in managed.pipes.drain(..) {
            if let Err(e) = pipe.await {
                tracing::warn!(rank = managed.rank, error = %e, "output forwarder stopped");
            }
        }
        if status.success() {
            tracing::debug!(rank = managed.rank, "rank exited");
        } else {
            tracing::error!(rank = managed.rank, code = ?status.code(), "rank failed");
            failed.push(managed.rank);
        }
    }
    Ok(failed)
}

fn sibling_binary(name: &str) -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cannot locate directory of {}", exe.display()))?;
    Ok(dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}
