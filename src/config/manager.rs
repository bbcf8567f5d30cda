//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(name).ok())
    }

    /// Apply `GITSPY_*` variables from `lookup` on top of the defaults.
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_addr) = lookup("GITSPY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid GITSPY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(max_conn) = lookup("GITSPY_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid GITSPY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(host_key) = lookup("GITSPY_HOST_KEY") {
            config.server.host_key_path = PathBuf::from(host_key);
        }

        if let Some(host) = lookup("GITSPY_UPSTREAM_HOST") {
            config.upstream.host = host;
        }

        if let Some(port) = lookup("GITSPY_UPSTREAM_PORT") {
            config.upstream.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid GITSPY_UPSTREAM_PORT: {}", port))?;
        }

        if let Some(user) = lookup("GITSPY_UPSTREAM_USER") {
            config.upstream.user = user;
        }

        if let Some(timeout) = lookup("GITSPY_CONNECT_TIMEOUT") {
            config.upstream.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid GITSPY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = lookup("GITSPY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line that override the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub host_key: Option<PathBuf>,
    pub max_connections: Option<usize>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.host_key_path.as_os_str().is_empty() {
            bail!("host_key_path must not be empty");
        }

        if self.server.inactivity_timeout.is_zero() {
            bail!("inactivity_timeout must be greater than 0");
        }

        for (i, user) in self.server.allowed_users.iter().enumerate() {
            if user.is_empty() {
                bail!("Allowed user {} is empty", i);
            }
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.host.is_empty() {
            bail!("upstream.host must not be empty");
        }

        if self.upstream.port == 0 {
            bail!("upstream.port must not be 0");
        }

        if self.upstream.user.is_empty() {
            bail!("upstream.user must not be empty");
        }

        if self.upstream.connect_timeout.is_zero() {
            bail!("upstream.connect_timeout must be greater than 0");
        }

        if self.upstream.allowed_command.trim().is_empty() {
            bail!("upstream.allowed_command must not be empty");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.pipe_capacity < 1024 {
            bail!("pipe_capacity must be at least 1024 bytes");
        }

        if self.relay.pipe_capacity > 1048576 {
            bail!("pipe_capacity cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", VALID_LOG_LEVELS.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(bind_str) = overrides.bind.as_deref() {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = overrides.port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(host) = &overrides.upstream_host {
            self.upstream.host = host.clone();
            tracing::info!("CLI override: upstream host set to {}", host);
        }

        if let Some(port) = overrides.upstream_port {
            self.upstream.port = port;
            tracing::info!("CLI override: upstream port set to {}", port);
        }

        if let Some(host_key) = &overrides.host_key {
            self.server.host_key_path = host_key.clone();
            tracing::info!("CLI override: host key set to {}", host_key.display());
        }

        if let Some(max_conn) = overrides.max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }
    }
}
