//! Data Relay Module
//!
//! Moves one command's byte streams between the client and the upstream,
//! decoding the upstream's pkt-lines for inspection until the first flush.

pub mod engine;
pub mod inspect;
pub mod session;
pub mod sink;

pub use engine::{PipeWriter, RelayEngine, RelayMode, DEFAULT_PIPE_CAPACITY};
pub use inspect::{Inspector, LoggingInspector, PassThrough};
pub use session::{RelayStats, RelaySummary};
pub use sink::{ByteSink, ChannelSink};
