//! Seams between the session controller and the SSH transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::protocol::ChannelRequest;
use crate::relay::ByteSink;

/// Readable half of a byte stream handed across a seam.
pub type InboundReader = Box<dyn AsyncRead + Send + Unpin>;

/// An accepted inbound session channel.
#[async_trait]
pub trait InboundChannel: Send {
    /// Next channel request, or `None` once the client stops sending them.
    async fn next_request(&mut self) -> Option<ChannelRequest>;

    /// Hand over the channel's data streams: what the client sends, and a
    /// sink toward the client. Returns `None` after the first call.
    fn take_io(&mut self) -> Option<(InboundReader, Arc<dyn ByteSink>)>;

    /// Report the command's exit status to the client.
    async fn exit_status(&mut self, status: u32);

    /// Close the channel. Idempotent.
    async fn close(&mut self);
}

/// How the remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal(String),
    /// The upstream channel closed without reporting either.
    Unknown,
}

/// A command running on the upstream host.
pub struct UpstreamSession {
    pub stdin: Arc<dyn ByteSink>,
    pub stdout: InboundReader,
    pub stderr: InboundReader,
    pub exit: oneshot::Receiver<ExitStatus>,
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("stdin_closed", &self.stdin.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens upstream sessions running a given command.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn start(&self, command: &str) -> Result<UpstreamSession, SessionError>;
}
