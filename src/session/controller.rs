//! Session Controller
//!
//! Drives one inbound channel through
//! `AwaitingRequest -> Validating -> Proxying -> Draining -> Terminated`.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::{ExitStatus, InboundChannel, InboundReader, UpstreamConnector, UpstreamSession};
use crate::error::SessionError;
use crate::protocol::constants::{REQUEST_EXEC, UPLOAD_PACK_COMMAND};
use crate::protocol::ChannelRequest;
use crate::relay::{Inspector, PassThrough, PipeWriter, RelayEngine, RelaySummary, DEFAULT_PIPE_CAPACITY};

/// Per-session knobs taken from the relay and upstream configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Commands must start with this name to be accepted.
    pub allowed_command: String,
    pub pipe_capacity: usize,
    /// Log every pkt-line the upstream sends at debug level.
    pub log_payloads: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            allowed_command: UPLOAD_PACK_COMMAND.to_string(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            log_payloads: true,
        }
    }
}

/// Terminal state of a session.
#[derive(Debug)]
pub enum SessionResult {
    /// The remote command exited successfully.
    Completed(u32),
    Failed(SessionError),
    /// The client stopped sending requests before any command was accepted.
    NoCommand,
}

impl SessionResult {
    /// Exit status to forward to the client, if the upstream reported one.
    pub fn exit_status(&self) -> Option<u32> {
        match self {
            SessionResult::Completed(status) => Some(*status),
            SessionResult::Failed(e) => e.exit_status(),
            SessionResult::NoCommand => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionResult::Completed(_))
    }

    fn outcome(&self) -> &'static str {
        match self {
            SessionResult::Completed(_) => "completed",
            SessionResult::Failed(_) => "failed",
            SessionResult::NoCommand => "no_command",
        }
    }
}

/// Runs the request loop and the proxied command for one inbound channel.
pub struct SessionController<C> {
    session_id: String,
    channel: C,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
    inspector: Option<Arc<dyn Inspector>>,
}

impl<C: InboundChannel> SessionController<C> {
    pub fn new(
        session_id: impl Into<String>,
        channel: C,
        connector: Arc<dyn UpstreamConnector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            channel,
            connector,
            settings,
            inspector: None,
        }
    }

    /// Use a custom inspector for the upstream's pkt-lines.
    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the session to completion. The channel is always closed on return.
    pub async fn run(mut self) -> SessionResult {
        let start_time = Instant::now();

        let result = match self.await_command().await {
            Some(command) => self.proxy(&command).await,
            None => SessionResult::NoCommand,
        };

        // Terminated
        if let Some(status) = result.exit_status() {
            self.channel.exit_status(status).await;
        }
        self.channel.close().await;

        metrics::increment_counter!("gitspy_sessions_total", "outcome" => result.outcome());
        match &result {
            SessionResult::Completed(status) => info!(
                session_id = %self.session_id,
                status,
                duration_ms = start_time.elapsed().as_millis() as u64,
                "Session completed"
            ),
            SessionResult::Failed(e) => warn!(
                session_id = %self.session_id,
                error = %e,
                duration_ms = start_time.elapsed().as_millis() as u64,
                "Session failed"
            ),
            SessionResult::NoCommand => {
                debug!(session_id = %self.session_id, "Channel closed without a command")
            }
        }

        result
    }

    /// AwaitingRequest / Validating: reject until an acceptable exec arrives.
    async fn await_command(&mut self) -> Option<String> {
        while let Some(mut request) = self.channel.next_request().await {
            debug!(session_id = %self.session_id, kind = request.kind(), "Channel request");

            match self.validate(&request) {
                Ok(command) => {
                    request.reply(true);
                    info!(session_id = %self.session_id, command = %command, "Accepted command");
                    return Some(command);
                }
                Err(e) => {
                    info!(session_id = %self.session_id, reason = %e, "Rejecting channel request");
                    metrics::increment_counter!(
                        "gitspy_rejected_requests_total",
                        "kind" => request.kind().to_string()
                    );
                    request.reply(false);
                }
            }
        }

        None
    }

    fn validate(&self, request: &ChannelRequest) -> Result<String, RequestRejection> {
        if request.kind() != REQUEST_EXEC {
            return Err(RequestRejection::Kind(request.kind().to_string()));
        }

        let command = request.command().map_err(RequestRejection::Payload)?;
        if !command.starts_with(&self.settings.allowed_command) {
            return Err(RequestRejection::Command(SessionError::UnsupportedCommand(command)));
        }

        Ok(command)
    }

    /// Proxying and Draining.
    async fn proxy(&mut self, command: &str) -> SessionResult {
        let (inbound, toward_client) = match self.channel.take_io() {
            Some(io) => io,
            None => return SessionResult::Failed(SessionError::ChannelUnavailable),
        };

        let UpstreamSession {
            stdin,
            stdout,
            stderr,
            exit,
        } = match self.connector.start(command).await {
            Ok(upstream) => upstream,
            Err(e) => return SessionResult::Failed(e),
        };

        let mut engine = RelayEngine::new(self.session_id.clone(), toward_client, stdin)
            .with_pipe_capacity(self.settings.pipe_capacity);
        if let Some(inspector) = &self.inspector {
            engine = engine.with_inspector(Arc::clone(inspector));
        } else if !self.settings.log_payloads {
            engine = engine.with_inspector(Arc::new(PassThrough));
        }

        let client_feed = tokio::spawn(feed(inbound, engine.client_pipe()));
        let server_feed = tokio::spawn(feed(stdout, engine.server_pipe()));
        let diagnostics = tokio::spawn(drain_diagnostics(self.session_id.clone(), stderr));

        // Draining
        match server_feed.await {
            Ok(Ok(bytes)) => debug!(session_id = %self.session_id, bytes, "Upstream output ended"),
            Ok(Err(e)) => debug!(session_id = %self.session_id, error = %e, "Upstream output feed stopped"),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "Upstream output feeder failed"),
        }
        let relay = engine.finish().await;
        client_feed.abort();

        let summary = match relay {
            Ok(summary) => summary,
            Err(e) => {
                diagnostics.abort();
                return SessionResult::Failed(e.into());
            }
        };

        let status = exit.await.unwrap_or(ExitStatus::Unknown);
        if let Err(e) = diagnostics.await {
            debug!(session_id = %self.session_id, error = %e, "Diagnostic drain stopped");
        }

        self.result_for(status, &summary)
    }

    fn result_for(&self, status: ExitStatus, summary: &RelaySummary) -> SessionResult {
        debug!(
            session_id = %self.session_id,
            ?status,
            frames = summary.frames,
            "Remote command finished"
        );

        match status {
            ExitStatus::Code(0) => SessionResult::Completed(0),
            ExitStatus::Code(code) => SessionResult::Failed(SessionError::RemoteCommandFailed(code)),
            ExitStatus::Signal(signal) => {
                SessionResult::Failed(SessionError::RemoteCommandSignaled(signal))
            }
            ExitStatus::Unknown => SessionResult::Failed(SessionError::UpstreamSessionFailed(
                "channel closed without an exit status".to_string(),
            )),
        }
    }
}

/// Why a channel request was turned down.
#[derive(Debug, thiserror::Error)]
enum RequestRejection {
    #[error("request type {0:?} is not handled")]
    Kind(String),
    #[error(transparent)]
    Payload(crate::error::ChannelError),
    #[error(transparent)]
    Command(SessionError),
}

/// Copy a stream into a relay pipe, then signal end of stream on the pipe.
async fn feed(mut reader: InboundReader, mut pipe: PipeWriter) -> std::io::Result<u64> {
    let copied = tokio::io::copy(&mut reader, &mut pipe).await;
    let _ = pipe.shutdown().await;
    copied
}

/// Log the upstream's diagnostic stream line by line.
async fn drain_diagnostics<R>(session_id: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(session_id = %session_id, "upstream: {}", text);
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read upstream diagnostics");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_exit_status() {
        assert_eq!(SessionResult::Completed(0).exit_status(), Some(0));
        assert_eq!(
            SessionResult::Failed(SessionError::RemoteCommandFailed(128)).exit_status(),
            Some(128)
        );
        assert_eq!(
            SessionResult::Failed(SessionError::UpstreamDialFailed("refused".into())).exit_status(),
            None
        );
        assert_eq!(SessionResult::NoCommand.exit_status(), None);
    }

    #[test]
    fn test_default_settings_allow_upload_pack() {
        let settings = SessionSettings::default();
        assert_eq!(settings.allowed_command, "git-upload-pack");
        assert!(settings.log_payloads);
    }
}
