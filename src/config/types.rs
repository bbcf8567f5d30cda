//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::constants::UPLOAD_PACK_COMMAND;
use crate::relay::DEFAULT_PIPE_CAPACITY;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub monitoring: MonitoringConfig,
}

/// Inbound SSH server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Private key presented to connecting clients
    pub host_key_path: PathBuf,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub auth_rejection_time: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Usernames allowed to log in. Empty accepts anyone.
    pub allowed_users: Vec<String>,
}

/// Upstream repository host configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key used instead of the SSH agent when set
    pub identity_file: Option<PathBuf>,
    /// Pinned host key fingerprint. Unset accepts any host key.
    pub host_key_fingerprint: Option<String>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command prefix a client may execute
    pub allowed_command: String,
}

/// Relay engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub pipe_capacity: usize,
    /// Log every upstream pkt-line at debug level
    pub log_payloads: bool,
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Prometheus exporter listen address. Unset disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 2022)),
            host_key_path: PathBuf::from("id_rsa"),
            max_connections: 100,
            inactivity_timeout: Duration::from_secs(600),
            auth_rejection_time: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            allowed_users: Vec::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "github.com".to_string(),
            port: 22,
            user: "git".to_string(),
            identity_file: None,
            host_key_fingerprint: None,
            connect_timeout: Duration::from_secs(10),
            allowed_command: UPLOAD_PACK_COMMAND.to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            log_payloads: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl UpstreamConfig {
    /// `host:port` as used in log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
