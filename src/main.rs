//! gitspy - git-upload-pack interception proxy

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

use gitspy::config::{CliOverrides, ConfigManager};
use gitspy::connection::load_host_key;
use gitspy::upstream::SshUpstream;
use gitspy::{ConnectionManager, ShutdownCoordinator};

/// CLI arguments for gitspy
#[derive(Parser, Debug)]
#[command(name = "gitspy")]
#[command(about = "SSH proxy that logs git-upload-pack traffic")]
#[command(version)]
#[command(long_about = "
gitspy - SSH proxy that logs git-upload-pack traffic

Clients connect over SSH and run git-upload-pack as they would against the
real host. gitspy runs the same command upstream and logs each pkt-line the
upstream sends before the packfile.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  GITSPY_BIND_ADDR        - Bind address (e.g., 127.0.0.1:2022)
  GITSPY_MAX_CONNECTIONS  - Maximum concurrent connections
  GITSPY_HOST_KEY         - Path to the server host key
  GITSPY_UPSTREAM_HOST    - Upstream host (e.g., github.com)
  GITSPY_UPSTREAM_PORT    - Upstream SSH port
  GITSPY_UPSTREAM_USER    - Upstream service account
  GITSPY_CONNECT_TIMEOUT  - Upstream connect timeout (e.g., 10s)
  GITSPY_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "gitspy.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:2022)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    #[arg(long, help = "Upstream host")]
    pub upstream_host: Option<String>,

    #[arg(long, help = "Upstream SSH port")]
    pub upstream_port: Option<u16>,

    #[arg(long, help = "Path to the server host key")]
    pub host_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configured `monitoring.log_level`.
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Maximum number of concurrent connections
    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind: self.bind.clone(),
            port: self.port,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            host_key: self.host_key.clone(),
            max_connections: self.max_connections,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let log_filter = init_tracing(&args)?;

    info!("Starting gitspy v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&args.overrides());

    config
        .validate()
        .context("Final configuration validation failed")?;

    if let Some(filter) = log_filter {
        filter
            .reload(EnvFilter::new(&config.monitoring.log_level))
            .context("Failed to apply configured log level")?;
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Host key: {}", config.server.host_key_path.display());
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Upstream: {}@{}", config.upstream.user, config.upstream.endpoint());
        info!(
            "  Upstream auth: {}",
            match &config.upstream.identity_file {
                Some(path) => format!("identity file {}", path.display()),
                None => "ssh agent".to_string(),
            }
        );
        info!("  Allowed command: {}", config.upstream.allowed_command);
        info!("  Pipe capacity: {} bytes", config.relay.pipe_capacity);
        info!(
            "  Metrics: {}",
            match config.monitoring.metrics_addr {
                Some(addr) => format!("enabled on {}", addr),
                None => "disabled".to_string(),
            }
        );
        return Ok(());
    }

    if let Some(addr) = config.monitoring.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("Failed to start metrics exporter on {}", addr))?;
        info!("Metrics exporter listening on {}", addr);
    }

    let host_key = load_host_key(&config.server.host_key_path)?;
    let connector = Arc::new(SshUpstream::new(
        config.upstream.clone(),
        config.relay.pipe_capacity,
    ));

    info!("Upstream: {}@{}", config.upstream.user, config.upstream.endpoint());

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let mut manager = ConnectionManager::new(Arc::new(config), host_key, connector);
    manager.bind().await?;

    let mut shutdown_rx = shutdown_coordinator.subscribe();
    let server_handle = tokio::spawn(async move {
        tokio::select! {
            result = manager.start() => {
                if let Err(e) = result {
                    error!("Server error: {:#}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Server task received shutdown signal");
                if let Err(e) = manager.shutdown().await {
                    error!("Error during connection cleanup: {}", e);
                }
            }
        }
    });

    info!("gitspy started, press Ctrl+C or send SIGTERM to stop");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!(
        "Initiating graceful shutdown (timeout: {:?})",
        shutdown_coordinator.timeout()
    );

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    info!("Server shutdown complete");

    Ok(())
}

type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize tracing/logging
///
/// Returns a handle for applying the configured log level when neither
/// `RUST_LOG` nor a command line level was given.
fn init_tracing(args: &CliArgs) -> Result<Option<LogFilterHandle>> {
    let cli_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };

    let (env_filter, from_config) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, false),
        Err(_) => match cli_level {
            Some(level) => (EnvFilter::new(level), false),
            None => (EnvFilter::new("info"), true),
        },
    };

    let (env_filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(from_config.then_some(handle))
}
