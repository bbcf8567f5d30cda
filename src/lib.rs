//! gitspy
//!
//! An SSH proxy for `git-upload-pack` that relays a fetch to the real
//! repository host and logs every pkt-line the host sends back until the
//! packfile starts.

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod upstream;

pub use config::Config;
pub use connection::ConnectionManager;
pub use relay::RelayEngine;
pub use session::SessionController;
pub use shutdown::ShutdownCoordinator;

/// Common error type for startup and configuration
pub type Result<T> = anyhow::Result<T>;
