//! SSH client toward the upstream repository host

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::error::SessionError;
use crate::relay::ChannelSink;
use crate::session::{ExitStatus, UpstreamConnector, UpstreamSession};

/// Chunks of client input buffered on their way to the upstream channel.
const STDIN_QUEUE_DEPTH: usize = 32;

/// Verifies the upstream host key.
struct UpstreamHandler {
    endpoint: String,
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        match &self.expected_fingerprint {
            Some(expected) => {
                let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
                if expected == fingerprint {
                    debug!(endpoint = %self.endpoint, "Upstream host key matches pinned fingerprint");
                    Ok(true)
                } else {
                    warn!(
                        endpoint = %self.endpoint,
                        fingerprint = %fingerprint,
                        "Upstream host key does not match pinned fingerprint"
                    );
                    Ok(false)
                }
            }
            None => {
                warn!(
                    endpoint = %self.endpoint,
                    fingerprint = %fingerprint,
                    "No pinned upstream host key, accepting"
                );
                Ok(true)
            }
        }
    }
}

/// Opens one upstream SSH connection per proxied command.
pub struct SshUpstream {
    config: UpstreamConfig,
    ssh_config: Arc<client::Config>,
    pipe_capacity: usize,
}

impl SshUpstream {
    pub fn new(config: UpstreamConfig, pipe_capacity: usize) -> Self {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };

        Self {
            config,
            ssh_config: Arc::new(ssh_config),
            pipe_capacity: pipe_capacity.max(1),
        }
    }

    async fn connect(&self) -> Result<client::Handle<UpstreamHandler>, SessionError> {
        let endpoint = self.config.endpoint();
        let handler = UpstreamHandler {
            endpoint: endpoint.clone(),
            expected_fingerprint: self.config.host_key_fingerprint.clone(),
        };

        debug!(endpoint = %endpoint, "Dialing upstream");
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(
                Arc::clone(&self.ssh_config),
                (self.config.host.as_str(), self.config.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            SessionError::UpstreamDialFailed(format!(
                "{} did not answer within {:?}",
                endpoint, self.config.connect_timeout
            ))
        })?
        .map_err(|e| SessionError::UpstreamDialFailed(format!("{}: {}", endpoint, e)))?;

        let authenticated = match &self.config.identity_file {
            Some(path) => authenticate_with_key(&mut handle, &self.config.user, path).await?,
            None => authenticate_with_agent(&mut handle, &self.config.user).await?,
        };

        if !authenticated {
            return Err(SessionError::UpstreamDialFailed(format!(
                "{} rejected authentication for user {}",
                endpoint, self.config.user
            )));
        }

        info!(endpoint = %endpoint, user = %self.config.user, "Connected to upstream");
        Ok(handle)
    }
}

#[async_trait]
impl UpstreamConnector for SshUpstream {
    async fn start(&self, command: &str) -> Result<UpstreamSession, SessionError> {
        let handle = self.connect().await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::UpstreamSessionFailed(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SessionError::UpstreamSessionFailed(format!("failed to start command: {}", e)))?;

        debug!(command = %command, "Started upstream command");

        let (stdin, stdin_rx) = ChannelSink::bounded(STDIN_QUEUE_DEPTH);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(self.pipe_capacity);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(self.pipe_capacity);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let status = pump_channel(channel, stdin_rx, stdout_tx, stderr_tx).await;
            let _ = exit_tx.send(status);
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "")
                .await;
        });

        Ok(UpstreamSession {
            stdin: Arc::new(stdin),
            stdout: Box::new(stdout_rx),
            stderr: Box::new(stderr_rx),
            exit: exit_rx,
        })
    }
}

async fn authenticate_with_key(
    handle: &mut client::Handle<UpstreamHandler>,
    user: &str,
    path: &Path,
) -> Result<bool, SessionError> {
    debug!(path = %path.display(), "Authenticating upstream with identity file");
    let key_pair = russh_keys::load_secret_key(path, None).map_err(|e| {
        SessionError::UpstreamDialFailed(format!(
            "failed to load identity file {}: {}",
            path.display(),
            e
        ))
    })?;

    handle
        .authenticate_publickey(user, Arc::new(key_pair))
        .await
        .map_err(|e| SessionError::UpstreamDialFailed(format!("public key auth failed: {}", e)))
}

/// Try every identity the agent at `SSH_AUTH_SOCK` offers.
#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<UpstreamHandler>,
    user: &str,
) -> Result<bool, SessionError> {
    use russh_keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| SessionError::UpstreamDialFailed(format!("failed to open ssh agent: {}", e)))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| SessionError::UpstreamDialFailed(format!("ssh agent has no identities: {}", e)))?;

    debug!(count = identities.len(), "Trying ssh agent identities");
    for key in identities {
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => debug!(error = ?e, "Agent signing failed, trying next identity"),
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut client::Handle<UpstreamHandler>,
    _user: &str,
) -> Result<bool, SessionError> {
    Err(SessionError::UpstreamDialFailed(
        "ssh agent authentication needs a unix socket; set upstream.identity_file".to_string(),
    ))
}

/// Own the upstream channel: feed it client input, split its output into the
/// stdout and stderr pipes, and return how the command ended.
async fn pump_channel(
    mut channel: Channel<Msg>,
    mut stdin: mpsc::Receiver<Bytes>,
    stdout: DuplexStream,
    mut stderr: DuplexStream,
) -> ExitStatus {
    let mut status = ExitStatus::Unknown;
    let mut stdout = Some(stdout);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            chunk = stdin.recv(), if stdin_open => match chunk {
                Some(bytes) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!(error = %e, "Failed to send client data upstream");
                        stdin_open = false;
                    }
                }
                None => {
                    stdin_open = false;
                    debug!("Client input finished, sending EOF upstream");
                    let _ = channel.eof().await;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(out) = stdout.as_mut() {
                        if out.write_all(&data).await.is_err() {
                            debug!("Relay stopped reading upstream output");
                            stdout = None;
                        }
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    let _ = stderr.write_all(&data).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = ExitStatus::Code(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    status = ExitStatus::Signal(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    if let Some(mut out) = stdout.take() {
                        let _ = out.shutdown().await;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            },
        }
    }

    if let Some(mut out) = stdout.take() {
        let _ = out.shutdown().await;
    }
    let _ = stderr.shutdown().await;

    debug!(?status, "Upstream channel closed");
    status
}
