//! Session Module
//!
//! One [`SessionController`] runs per inbound session channel. It waits for
//! an acceptable command, mirrors it on the upstream and relays the streams
//! until the remote command exits.

pub mod channel;
pub mod controller;

pub use channel::{ExitStatus, InboundChannel, InboundReader, UpstreamConnector, UpstreamSession};
pub use controller::{SessionController, SessionResult, SessionSettings};
