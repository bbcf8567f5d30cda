//! Connection Management Module
//!
//! Accepts TCP connections, runs the SSH server side on each and hands every
//! session channel to a session controller.

pub mod channel;
pub mod handler;
pub mod manager;

pub use channel::{HandleSink, SshInboundChannel};
pub use handler::ConnectionHandler;
pub use manager::{load_host_key, ConnectionManager};
