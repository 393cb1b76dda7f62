use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, PoisonError};
use std::thread;
use std::time::Instant;

use sgpu_core::OpError;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::DispatchError;
use crate::metrics::DispatchState;
use crate::operation::{ExecContext, OpCategory, Operation};
use crate::queue::StreamQueue;
use crate::stream::Stream;

use super::report::{DrainReport, StreamReport};
use super::Dispatcher;

impl Dispatcher {
    /// Drain every stream registered in `queue` so far and release them.
    ///
    /// Blocks until all operations of the pass have run. Operation failures
    /// land in the operations' tickets and in the report, never in the
    /// returned `Result`.
    pub fn launch_all(
        &self,
        queue: &StreamQueue,
        broker: &Broker,
    ) -> Result<DrainReport, DispatchError> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let pass_no = self.pass_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let pass = queue.begin_pass()?;

        self.set_state(DispatchState::Draining);
        debug!(pass = pass_no, streams = pass.len(), "dispatch pass started");
        let start = Instant::now();

        let reports = self.drain_streams(&pass, broker);

        let report = DrainReport::from_streams(pass_no, reports, start.elapsed());
        let released = queue.release_drained();

        {
            let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            m.record_pass(report.streams);
            m.state = DispatchState::Idle;
        }

        if report.is_clean() {
            debug!(
                pass = pass_no,
                streams = report.streams,
                operations = report.operations,
                duration = ?report.duration,
                "dispatch pass finished"
            );
        } else {
            info!(
                pass = pass_no,
                streams = report.streams,
                failed = report.failed,
                skipped = report.skipped,
                "dispatch pass finished with failures"
            );
        }

        released?;
        Ok(report)
    }

    /// Drain `pass` on scoped worker threads, the caller being one of them.
    ///
    /// Workers pull the next undrained stream until none is left. A worker
    /// that cannot be spawned is logged and its share falls to the others.
    fn drain_streams(&self, pass: &[Stream], broker: &Broker) -> Vec<StreamReport> {
        let workers = self.threads.min(pass.len());
        if workers <= 1 {
            return pass
                .iter()
                .map(|stream| self.execute_stream(stream, broker))
                .collect();
        }

        let next = AtomicUsize::new(0);
        let slots: Vec<OnceLock<StreamReport>> = pass.iter().map(|_| OnceLock::new()).collect();
        let worker = || loop {
            let i = next.fetch_add(1, Ordering::Relaxed);
            let (Some(stream), Some(slot)) = (pass.get(i), slots.get(i)) else {
                break;
            };
            let _ = slot.set(self.execute_stream(stream, broker));
        };

        thread::scope(|scope| {
            for i in 1..workers {
                let spawned = thread::Builder::new()
                    .name(format!("sgpu-dispatch-{i}"))
                    .spawn_scoped(scope, &worker);
                if let Err(e) = spawned {
                    warn!(worker = i, error = %e, "cannot spawn dispatch worker");
                    break;
                }
            }
            worker();
        });

        slots
            .into_iter()
            .zip(pass)
            .map(|(slot, stream)| {
                slot.into_inner()
                    .unwrap_or_else(|| StreamReport::empty(stream.id(), stream.device()))
            })
            .collect()
    }

    /// Run one stream's operations in order on its device.
    ///
    /// After a failure the rest of the stream is marked skipped.
    pub(crate) fn execute_stream(&self, stream: &Stream, broker: &Broker) -> StreamReport {
        let mut report = StreamReport::empty(stream.id(), stream.device());
        let ops = match stream.begin_drain() {
            Ok(ops) => ops,
            Err(e) => {
                warn!(stream = %stream.id(), error = %e, "stream not drainable; skipping");
                return report;
            }
        };

        let ctx = ExecContext {
            rank: broker.rank(),
            device: stream.device(),
        };
        let start = Instant::now();
        report.operations = ops.len();

        let mut ops = ops.into_iter().enumerate();
        for (seq, op) in ops.by_ref() {
            if self.execute_op(op, &ctx, broker, stream).is_err() {
                report.failed_at = Some(seq);
                break;
            }
            report.completed += 1;
        }
        for (_, op) in ops {
            op.ticket.complete(Err(OpError::Skipped));
            report.skipped += 1;
        }
        if report.skipped > 0 {
            self.metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .record_skipped(report.skipped as u64);
        }

        stream.finish_drain();
        report.duration = start.elapsed();
        report
    }

    /// Acquire the primitive for `op`, run it, release, and fill its ticket.
    fn execute_op(
        &self,
        op: Operation,
        ctx: &ExecContext,
        broker: &Broker,
        stream: &Stream,
    ) -> Result<(), OpError> {
        let Operation {
            category,
            label,
            work,
            ticket,
            ..
        } = op;

        let guard = match broker.acquire_for(ctx.device, category) {
            Ok(guard) => guard,
            Err(e) => {
                let err = OpError::from(e);
                warn!(stream = %stream.id(), device = ctx.device, %category, %label, error = %err, "cannot acquire device primitive");
                self.metrics
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ops_failed += 1;
                ticket.complete(Err(err.clone()));
                return Err(err);
            }
        };

        let start = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(panic_error(category, &*payload)),
        };
        let elapsed = start.elapsed();
        let waited = guard.as_ref().map(|g| (g.primitive(), g.waited()));
        drop(guard);

        {
            let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            if let Some((primitive, waited)) = waited {
                m.record_lock_wait(primitive, waited);
            }
            m.record_op(category, elapsed, outcome.is_err());
        }

        match &outcome {
            Ok(()) => debug!(stream = %stream.id(), device = ctx.device, %category, %label, ?elapsed, "operation done"),
            Err(e) => warn!(stream = %stream.id(), device = ctx.device, %category, %label, error = %e, "operation failed"),
        }
        ticket.complete(outcome.clone());
        outcome
    }
}

fn panic_error(category: OpCategory, payload: &(dyn Any + Send)) -> OpError {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let msg = format!("operation panicked: {msg}");
    match category {
        OpCategory::Transfer => OpError::Transfer(msg),
        OpCategory::Compute | OpCategory::Pack => OpError::Compute(msg),
    }
}
