//! Node-local GPU sharing: ordered operation streams dispatched onto devices
//! that several rank processes share.

pub mod attachment;
pub mod broker;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod stream;

pub use attachment::{Attachment, DeviceProbe, SimulatedProbe};
pub use broker::{Broker, BrokerGuard};
pub use context::{InitReport, InitSummary, SharingContext};
pub use dispatch::{DispatchConfig, Dispatcher, DrainReport, StreamReport};
pub use error::DispatchError;
pub use metrics::{DispatchMetrics, DispatchState};
pub use operation::{ExecContext, OpCategory, OpTicket, Operation, Precision, Primitive, PENDING};
pub use queue::StreamQueue;
pub use stream::{Stream, StreamState};
