//! Connection Manager Implementation

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::ConnectionHandler;
use crate::config::Config;
use crate::session::{SessionSettings, UpstreamConnector};
use crate::Result;

/// Load the server's host key.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key: {}", path.display()))
}

/// Accepts client connections and runs the SSH server protocol on each.
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    config: Arc<Config>,
    ssh_config: Arc<russh::server::Config>,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
    allowed_users: Arc<Vec<String>>,
    connection_slots: Arc<Semaphore>,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicUsize>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new(config: Arc<Config>, host_key: KeyPair, connector: Arc<dyn UpstreamConnector>) -> Self {
        let ssh_config = russh::server::Config {
            keys: vec![host_key],
            inactivity_timeout: Some(config.server.inactivity_timeout),
            auth_rejection_time: config.server.auth_rejection_time,
            ..Default::default()
        };

        let settings = SessionSettings {
            allowed_command: config.upstream.allowed_command.clone(),
            pipe_capacity: config.relay.pipe_capacity,
            log_payloads: config.relay.log_payloads,
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listener: None,
            ssh_config: Arc::new(ssh_config),
            connector,
            settings,
            allowed_users: Arc::new(config.server.allowed_users.clone()),
            connection_slots: Arc::new(Semaphore::new(config.server.max_connections)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicUsize::new(1)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            config,
        }
    }

    /// Bind the listener. Returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!("Successfully bound to {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Start the connection manager and begin accepting connections
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }

        self.accept_connections().await
    }

    /// Main connection acceptance loop
    async fn accept_connections(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    self.shutdown_flag.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Spawn the task serving one accepted connection.
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        if self.shutdown_flag.load(Ordering::Relaxed) {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        let slot = match Arc::clone(&self.connection_slots).try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {}", addr);
                metrics::increment_counter!("gitspy_connections_rejected_total");
                return;
            }
        };

        let connection_id = format!(
            "conn_{}",
            self.next_connection_id.fetch_add(1, Ordering::Relaxed)
        );

        let handler = ConnectionHandler::new(
            connection_id.clone(),
            addr,
            Arc::clone(&self.connector),
            self.settings.clone(),
            Arc::clone(&self.allowed_users),
        );
        let ssh_config = Arc::clone(&self.ssh_config);
        let active_connections = Arc::clone(&self.active_connections);

        tokio::spawn(async move {
            let start_time = Instant::now();
            active_connections.fetch_add(1, Ordering::Relaxed);
            metrics::increment_gauge!("gitspy_active_connections", 1.0);
            metrics::increment_counter!("gitspy_connections_total");

            info!("Started handling connection {} from {}", connection_id, addr);

            match Self::handle_connection(stream, ssh_config, handler, slot, &connection_id).await {
                Ok(()) => debug!("Connection {} completed successfully", connection_id),
                Err(e) => warn!("Error handling connection {}: {:#}", connection_id, e),
            }

            info!(
                "Connection {} from {} closed after {:?}",
                connection_id,
                addr,
                start_time.elapsed()
            );
            metrics::decrement_gauge!("gitspy_active_connections", 1.0);
            active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Run the SSH protocol on `stream` until the client disconnects.
    ///
    /// Shutdown does not cut running sessions short; the manager waits for
    /// them up to `shutdown_timeout`.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    async fn handle_connection(
        stream: TcpStream,
        ssh_config: Arc<russh::server::Config>,
        handler: ConnectionHandler,
        _slot: OwnedSemaphorePermit,
        connection_id: &str,
    ) -> Result<()> {
        let session = russh::server::run_stream(ssh_config, stream, handler)
            .await
            .context("SSH handshake failed")?;

        session.await.context("SSH session ended with an error")
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the bind address if listener is initialized
    pub fn get_bind_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No connection handlers to notify of shutdown: {}", e);
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait for all connections to close gracefully
    pub async fn wait_for_connections_to_close(&self) -> Result<()> {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let start_time = Instant::now();

        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            debug!("Waiting for {} active connections to close", self.get_active_connections());
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let remaining = self.get_active_connections();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, remaining
            );
        }

        Ok(())
    }

    /// Gracefully shutdown the connection manager
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_connections_to_close().await
    }
}
