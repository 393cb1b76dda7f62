//! sgpu-rank — one rank of a node sharing its GPUs.
//!
//! Initializes device sharing from the node config, builds simulated streams
//! `[pack, transfer-in, compute, transfer-out]` whose compute step forks onto
//! rayon, launches them, and prints the init summary plus drain reports as
//! JSON on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! sgpu-rank --rank 0 --config sgpu.conf --streams 2 --trace /tmp/sgpu.trace
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use sgpu_core::OpError;
use sgpu_dispatch::{ExecContext, OpCategory, Operation, SharingContext, SimulatedProbe};

/// Run one rank against a node's shared devices.
#[derive(Parser, Debug)]
#[command(name = "sgpu-rank", version, about)]
struct Cli {
    /// Rank index on this node.
    #[arg(long, env = "SGPU_RANK")]
    rank: usize,

    /// Node configuration file.
    #[arg(long, env = "SGPU_CONFIG", default_value = "sgpu.conf")]
    config: PathBuf,

    /// Streams per pass.
    #[arg(long, default_value_t = 2)]
    streams: usize,

    /// Dispatch passes to run.
    #[arg(long, default_value_t = 1)]
    passes: usize,

    /// Simulated duration of each compute operation, in milliseconds.
    #[arg(long, default_value_t = 20)]
    compute_ms: u64,

    /// Simulated duration of each transfer operation, in milliseconds.
    #[arg(long, default_value_t = 5)]
    transfer_ms: u64,

    /// Append one line per operation to this file:
    /// `rank device stream seq category start_ns end_ns`.
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Devices whose simulated self-test fails (comma-separated).
    #[arg(long, value_delimiter = ',')]
    fail_self_test: Vec<usize>,
}

type Timeline = Arc<Mutex<Vec<String>>>;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let probe = SimulatedProbe::failing(cli.fail_self_test.iter().copied());
    let (ctx, report) = SharingContext::initialize(cli.rank, &cli.config, &probe);

    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    let mut drains = Vec::new();

    if ctx.is_attached() {
        for pass in 0..cli.passes {
            for s in 0..cli.streams {
                let stream = ctx.create_stream()?;
                let tag = pass * cli.streams + s;
                for (seq, category) in [
                    OpCategory::Pack,
                    OpCategory::Transfer,
                    OpCategory::Compute,
                    OpCategory::Transfer,
                ]
                .into_iter()
                .enumerate()
                {
                    stream.add_operation(simulated_op(&cli, &timeline, tag, seq, category))?;
                }
            }
            let drain = ctx.launch_all_streams()?;
            if !drain.is_clean() {
                warn!(pass = drain.pass, failed = drain.failed, "pass had failing streams");
            }
            drains.push(drain);
        }
    } else {
        info!(rank = cli.rank, "no device path; nothing to dispatch");
    }

    if let Some(path) = &cli.trace {
        let lines = timeline.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in lines.iter() {
            file.write_all(line.as_bytes())?;
        }
    }

    let output = serde_json::json!({
        "init": report.summary(),
        "drains": drains,
        "metrics": ctx.metrics(),
    });
    println!("{}", serde_json::to_string(&output)?);

    ctx.shutdown();
    Ok(())
}

fn simulated_op(
    cli: &Cli,
    timeline: &Timeline,
    stream: usize,
    seq: usize,
    category: OpCategory,
) -> Operation {
    let rank = cli.rank;
    let timeline = Arc::clone(timeline);
    let busy = match category {
        OpCategory::Compute => Duration::from_millis(cli.compute_ms),
        OpCategory::Transfer => Duration::from_millis(cli.transfer_ms),
        OpCategory::Pack => Duration::ZERO,
    };
    let label = format!("r{rank}s{stream}#{seq}");
    let work = move |exec: &ExecContext| {
        let start = now_ns();
        if category == OpCategory::Compute {
            // simulated kernels split their work across the rayon pool
            let half = busy / 2;
            rayon::join(
                || std::thread::sleep(half),
                || std::thread::sleep(busy - half),
            );
        } else {
            std::thread::sleep(busy);
        }
        let end = now_ns();
        timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{rank} {} {stream} {seq} {category} {start} {end}\n", exec.device));
        Ok::<(), OpError>(())
    };
    match category {
        OpCategory::Compute => Operation::compute(label, work),
        OpCategory::Transfer => Operation::transfer(label, 1 << 20, work),
        OpCategory::Pack => Operation::pack(label, work),
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
