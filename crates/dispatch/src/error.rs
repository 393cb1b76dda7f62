use thiserror::Error;
use uuid::Uuid;

/// Misuse of the dispatch API. Device or operation failures are reported
/// elsewhere: at initialization as `SharingError`, per operation as `OpError`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("rank {0} has no device access")]
    NotAttached(usize),

    #[error("no device {device} on this node ({device_count} devices)")]
    UnknownDevice { device: usize, device_count: usize },

    #[error("stream {id} is {state} and accepts no more operations")]
    StreamClosed { id: Uuid, state: &'static str },

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}
