//! Per-rank entry point: initialization, stream creation, launch, teardown.
//!
//! A [`SharingContext`] owns everything one rank needs to put work on a
//! shared device. Initialization never fails outright: any problem is logged
//! with the stage it happened at and the rank continues CPU-only.

use std::path::Path;

use serde::Serialize;
use sgpu_core::{host_identity, HardwareError, InitStage, NodeConfig, SharingError};
use tracing::{error, info};

use crate::attachment::{Attachment, DeviceProbe};
use crate::broker::Broker;
use crate::dispatch::{DispatchConfig, Dispatcher, DrainReport};
use crate::error::DispatchError;
use crate::metrics::DispatchMetrics;
use crate::queue::StreamQueue;
use crate::stream::Stream;

/// Device state of one rank.
#[derive(Debug)]
pub struct SharingContext {
    attachment: Attachment,
    config: Option<NodeConfig>,
    queue: StreamQueue,
    dispatcher: Option<Dispatcher>,
    broker: Option<Broker>,
}

impl SharingContext {
    /// Read the node configuration at `config_path` and set up the device
    /// path for `rank`. `SGPU_*` variables of the process override the file.
    pub fn initialize(
        rank: usize,
        config_path: impl AsRef<Path>,
        probe: &dyn DeviceProbe,
    ) -> (Self, InitReport) {
        Self::initialize_with_env(rank, config_path, std::env::vars(), probe)
    }

    /// Same as [`initialize`](Self::initialize), with overrides read from
    /// `vars` instead of the process environment.
    pub fn initialize_with_env(
        rank: usize,
        config_path: impl AsRef<Path>,
        vars: impl IntoIterator<Item = (String, String)>,
        probe: &dyn DeviceProbe,
    ) -> (Self, InitReport) {
        match NodeConfig::from_file_with_env(config_path, vars) {
            Ok(config) => Self::from_config(rank, config, probe),
            Err(e) => Self::disabled(rank, host_identity(), None, e.into()),
        }
    }

    /// Same as [`initialize`](Self::initialize) with an already-loaded config.
    pub fn from_config(
        rank: usize,
        config: NodeConfig,
        probe: &dyn DeviceProbe,
    ) -> (Self, InitReport) {
        let host = host_identity();
        match attach(rank, &host, &config, probe) {
            Ok(Some(broker)) => {
                let device = broker.current_device();
                let attachment = Attachment::attached(
                    rank,
                    host,
                    device,
                    config.use_gpu_conv,
                    config.use_gpu_blas,
                );
                info!(
                    rank,
                    host = %attachment.host(),
                    device,
                    gpu_conv = config.use_gpu_conv,
                    gpu_blas = config.use_gpu_blas,
                    "rank attached to device"
                );
                let report = InitReport::from_attachment(&attachment, None);
                let ctx = Self {
                    dispatcher: Some(Dispatcher::new(DispatchConfig::new(config.dispatch_threads))),
                    broker: Some(broker),
                    queue: StreamQueue::new(),
                    config: Some(config),
                    attachment,
                };
                (ctx, report)
            }
            Ok(None) => {
                info!(rank, host = %host, "no device feature requested; running CPU-only");
                let ctx = Self::cpu_only_with(rank, host, Some(config));
                let report = InitReport::from_attachment(&ctx.attachment, None);
                (ctx, report)
            }
            Err(e) => Self::disabled(rank, host, Some(config), e),
        }
    }

    /// A context with no device path.
    pub fn cpu_only(rank: usize) -> Self {
        Self::cpu_only_with(rank, host_identity(), None)
    }

    fn cpu_only_with(rank: usize, host: String, config: Option<NodeConfig>) -> Self {
        Self {
            attachment: Attachment::cpu_only(rank, host),
            config,
            queue: StreamQueue::new(),
            dispatcher: None,
            broker: None,
        }
    }

    fn disabled(
        rank: usize,
        host: String,
        config: Option<NodeConfig>,
        err: SharingError,
    ) -> (Self, InitReport) {
        error!(
            stage = %err.stage(),
            rank,
            host = %host,
            error = %err,
            "device path disabled; running CPU-only"
        );
        let ctx = Self::cpu_only_with(rank, host, config);
        let report = InitReport::from_attachment(&ctx.attachment, Some(err));
        (ctx, report)
    }

    pub fn rank(&self) -> usize {
        self.attachment.rank()
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_attached()
    }

    /// Configuration, when it could be loaded.
    pub fn config(&self) -> Option<&NodeConfig> {
        self.config.as_ref()
    }

    pub fn broker(&self) -> Option<&Broker> {
        self.broker.as_ref()
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    /// Dispatch metrics, `None` when CPU-only.
    pub fn metrics(&self) -> Option<DispatchMetrics> {
        self.dispatcher.as_ref().map(Dispatcher::metrics)
    }

    /// New empty stream on this rank's device, registered for the next launch.
    pub fn create_stream(&self) -> Result<Stream, DispatchError> {
        let broker = self.require_broker()?;
        self.register_new(broker.current_device())
    }

    /// New empty stream on an explicit device of this node.
    pub fn create_stream_on(&self, device: usize) -> Result<Stream, DispatchError> {
        let broker = self.require_broker()?;
        if device >= broker.device_count() {
            return Err(DispatchError::UnknownDevice {
                device,
                device_count: broker.device_count(),
            });
        }
        self.register_new(device)
    }

    fn register_new(&self, device: usize) -> Result<Stream, DispatchError> {
        let stream = Stream::new(device);
        self.queue.register(stream.clone())?;
        Ok(stream)
    }

    /// Run every stream created so far, then release them.
    pub fn launch_all_streams(&self) -> Result<DrainReport, DispatchError> {
        let broker = self.require_broker()?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or(DispatchError::NotAttached(self.rank()))?;
        dispatcher.launch_all(&self.queue, broker)
    }

    /// Tear down: wait for a running pass, release leftover streams, leave
    /// the share registry.
    pub fn shutdown(mut self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.wait_idle();
        }
        let released = self.queue.release_all();
        self.dispatcher = None;
        self.broker = None;
        info!(rank = self.rank(), released, "device sharing stopped");
    }

    fn require_broker(&self) -> Result<&Broker, DispatchError> {
        self.broker
            .as_ref()
            .ok_or(DispatchError::NotAttached(self.rank()))
    }
}

/// Run the device-path stages after config loading. `Ok(None)` means the
/// config asks for no device feature.
fn attach(
    rank: usize,
    host: &str,
    config: &NodeConfig,
    probe: &dyn DeviceProbe,
) -> Result<Option<Broker>, SharingError> {
    config.validate_rank(rank)?;
    if !config.wants_device() {
        return Ok(None);
    }
    config.log_summary();

    let broker = Broker::initialize(rank, config)?;
    let device = broker.current_device();
    probe.self_test(device).map_err(|reason| HardwareError {
        host: host.to_string(),
        rank,
        device,
        reason,
    })?;
    Ok(Some(broker))
}

/// Outcome of initialization.
#[derive(Debug)]
pub struct InitReport {
    /// Why the device path was disabled, if it was.
    pub error: Option<SharingError>,
    pub gpu_conv: bool,
    pub gpu_blas: bool,
    pub attached: bool,
    summary: InitSummary,
}

impl InitReport {
    fn from_attachment(attachment: &Attachment, error: Option<SharingError>) -> Self {
        let summary = InitSummary {
            rank: attachment.rank(),
            host: attachment.host().to_string(),
            attached: attachment.is_attached(),
            device: attachment.device(),
            gpu_conv: attachment.gpu_conv(),
            gpu_blas: attachment.gpu_blas(),
            error_code: error_code(error.as_ref()),
            stage: error.as_ref().map(SharingError::stage),
            error: error.as_ref().map(ToString::to_string),
        };
        Self {
            gpu_conv: attachment.gpu_conv(),
            gpu_blas: attachment.gpu_blas(),
            attached: attachment.is_attached(),
            error,
            summary,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Stage that failed, if any.
    pub fn stage(&self) -> Option<InitStage> {
        self.error.as_ref().map(SharingError::stage)
    }

    /// Integer code for the numerical-engine boundary: 0 success,
    /// 1 config, 2 sync-init, 3 hardware-check.
    pub fn error_code(&self) -> i32 {
        self.summary.error_code
    }

    /// Serializable view of the report.
    pub fn summary(&self) -> &InitSummary {
        &self.summary
    }
}

fn error_code(error: Option<&SharingError>) -> i32 {
    match error.map(SharingError::stage) {
        None => 0,
        Some(InitStage::Config) => 1,
        Some(InitStage::SyncInit) => 2,
        Some(InitStage::HardwareCheck) => 3,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub rank: usize,
    pub host: String,
    pub attached: bool,
    pub device: Option<usize>,
    pub gpu_conv: bool,
    pub gpu_blas: bool,
    pub error_code: i32,
    pub stage: Option<InitStage>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use sgpu_core::ConfigError;
    use tempfile::{NamedTempFile, TempDir};

    use super::*;
    use crate::attachment::SimulatedProbe;
    use crate::operation::Operation;

    fn write_config(dir: &TempDir, body: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "LOCK_DIR={}", dir.path().display()).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    fn init(
        rank: usize,
        path: impl AsRef<Path>,
        probe: &dyn DeviceProbe,
    ) -> (SharingContext, InitReport) {
        SharingContext::initialize_with_env(rank, path, [], probe)
    }

    #[test]
    fn attached_rank_runs_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=1\nUSE_GPU_CONV=1\n");
        let (ctx, report) = init(1, cfg.path(), &SimulatedProbe::new());

        assert!(report.is_ok());
        assert_eq!(report.error_code(), 0);
        assert!(report.attached && report.gpu_conv && !report.gpu_blas);
        assert_eq!(ctx.attachment().device(), Some(0));

        let stream = ctx.create_stream().unwrap();
        let ticket = stream
            .add_operation(Operation::compute("k", |exec| {
                assert_eq!(exec.rank, 1);
                Ok(())
            }))
            .unwrap();
        let drain = ctx.launch_all_streams().unwrap();
        assert_eq!(drain.operations, 1);
        assert_eq!(ticket.code(), 0);
        assert!(ctx.queue().is_empty());
        ctx.shutdown();
    }

    #[test]
    fn missing_file_disables_device_path() {
        let (ctx, report) = init(0, "/nonexistent/sgpu.conf", &SimulatedProbe::new());
        assert!(!ctx.is_attached());
        assert_eq!(report.stage(), Some(InitStage::Config));
        assert_eq!(report.error_code(), 1);
        assert!(matches!(
            report.error,
            Some(SharingError::Config(ConfigError::FileNotFound(_)))
        ));
        assert!(matches!(ctx.create_stream(), Err(DispatchError::NotAttached(0))));
        assert!(matches!(ctx.launch_all_streams(), Err(DispatchError::NotAttached(0))));
    }

    #[test]
    fn no_feature_requested_is_cpu_only_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=1\n");
        let (ctx, report) = init(0, cfg.path(), &SimulatedProbe::new());
        assert!(report.is_ok());
        assert!(!report.attached);
        assert!(!ctx.is_attached());
        assert!(ctx.config().is_some());
        assert!(ctx.metrics().is_none());
    }

    #[test]
    fn given_overrides_complete_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=2\nUSE_GPU_CONV=1\n");

        let (ctx, report) = init(0, cfg.path(), &SimulatedProbe::new());
        assert!(!ctx.is_attached());
        assert_eq!(report.stage(), Some(InitStage::Config));

        let vars = [("SGPU_NUM_GPU".to_string(), "1".to_string())];
        let (ctx, report) =
            SharingContext::initialize_with_env(0, cfg.path(), vars, &SimulatedProbe::new());
        assert!(report.is_ok());
        assert_eq!(ctx.attachment().device(), Some(0));
        ctx.shutdown();
    }

    #[test]
    fn rank_out_of_range_fails_config_stage() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=1\nUSE_GPU_BLAS=1\n");
        let (_ctx, report) = init(2, cfg.path(), &SimulatedProbe::new());
        assert!(matches!(
            report.error,
            Some(SharingError::Config(ConfigError::RankOutOfRange { rank: 2, .. }))
        ));
    }

    #[test]
    fn self_test_failure_is_tagged_with_host_and_device() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=2\nNUM_GPU=2\nUSE_GPU_BLAS=1\n");
        let probe = SimulatedProbe::failing([1]);

        let (bad, report) = init(1, cfg.path(), &probe);
        assert!(!bad.is_attached());
        assert_eq!(report.error_code(), 3);
        match &report.error {
            Some(SharingError::Hardware(e)) => {
                assert_eq!((e.rank, e.device), (1, 1));
                assert_eq!(e.host, bad.attachment().host());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(report.summary().stage, Some(InitStage::HardwareCheck));

        let (good, report) = init(0, cfg.path(), &probe);
        assert!(report.is_ok());
        assert!(good.is_attached());
    }

    #[test]
    fn create_stream_on_rejects_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=1\nNUM_GPU=2\nUSE_GPU_CONV=1\n");
        let (ctx, _) = init(0, cfg.path(), &SimulatedProbe::new());
        assert_eq!(ctx.create_stream_on(1).unwrap().device(), 1);
        assert!(matches!(
            ctx.create_stream_on(2),
            Err(DispatchError::UnknownDevice { device: 2, device_count: 2 })
        ));
    }

    #[test]
    fn shutdown_releases_unlaunched_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_config(&dir, "MPI_TASKS_PER_NODE=1\nNUM_GPU=1\nUSE_GPU_CONV=1\n");
        let (ctx, _) = init(0, cfg.path(), &SimulatedProbe::new());
        let stream = ctx.create_stream().unwrap();
        ctx.shutdown();
        assert_eq!(stream.state(), crate::stream::StreamState::Released);
    }
}
