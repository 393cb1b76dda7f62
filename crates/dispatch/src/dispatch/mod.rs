//! Dispatch loop -- drains the stream queue and runs every stream under
//! device arbitration.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, constructor, and accessor methods
//! - `execution`: pass execution, per-stream and per-operation
//! - `report`: serializable pass and stream reports

mod core;
mod execution;
mod report;

pub use self::core::{DispatchConfig, Dispatcher};
pub use self::report::{DrainReport, StreamReport};
