pub mod config;
pub mod error;
pub mod host;

pub use config::{NodeConfig, ShareTieBreak, SharingPolicy, StaticPartition};
pub use error::*;
pub use host::host_identity;
