//! Inbound SSH channel adapter

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::ChannelRequest;
use crate::relay::ByteSink;
use crate::session::{InboundChannel, InboundReader};

/// Writes toward the client through the server session handle.
pub struct HandleSink {
    id: ChannelId,
    handle: Handle,
    closed: AtomicBool,
}

impl HandleSink {
    pub fn new(id: ChannelId, handle: Handle) -> Self {
        Self {
            id,
            handle,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ByteSink for HandleSink {
    async fn write_all(&self, data: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::SinkClosed);
        }

        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| {
                RelayError::WriteFailed(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "client channel closed",
                ))
            })
    }

    /// Sends EOF on the channel the first time it is called.
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.handle.eof(self.id).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A session channel accepted by [`super::ConnectionHandler`].
///
/// Requests arrive from the handler over `requests`; client data is pumped
/// out of the russh channel into an in-memory pipe.
pub struct SshInboundChannel {
    id: ChannelId,
    handle: Handle,
    requests: mpsc::Receiver<ChannelRequest>,
    io: Option<(InboundReader, Arc<dyn ByteSink>)>,
    closed: bool,
}

impl SshInboundChannel {
    /// Wrap `channel`, spawning the task that copies its data into a pipe of
    /// `pipe_capacity` bytes.
    pub fn new(
        channel: Channel<Msg>,
        handle: Handle,
        requests: mpsc::Receiver<ChannelRequest>,
        pipe_capacity: usize,
    ) -> Self {
        let id = channel.id();
        let (writer, reader) = tokio::io::duplex(pipe_capacity.max(1));
        tokio::spawn(pump_client_data(channel, writer));

        let sink: Arc<dyn ByteSink> = Arc::new(HandleSink::new(id, handle.clone()));
        Self {
            id,
            handle,
            requests,
            io: Some((Box::new(reader), sink)),
            closed: false,
        }
    }
}

#[async_trait]
impl InboundChannel for SshInboundChannel {
    async fn next_request(&mut self) -> Option<ChannelRequest> {
        self.requests.recv().await
    }

    fn take_io(&mut self) -> Option<(InboundReader, Arc<dyn ByteSink>)> {
        self.io.take()
    }

    async fn exit_status(&mut self, status: u32) {
        if self.handle.exit_status_request(self.id, status).await.is_err() {
            debug!(channel = ?self.id, status, "Could not send exit status, channel gone");
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.requests.close();
        let _ = self.handle.close(self.id).await;
        debug!(channel = ?self.id, "Closed inbound channel");
    }
}

/// Copy the client's channel data into `writer` until EOF.
async fn pump_client_data(mut channel: Channel<Msg>, mut writer: DuplexStream) {
    let id = channel.id();

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if writer.write_all(&data).await.is_err() {
                    debug!(channel = ?id, "Client data pipe closed");
                    break;
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                debug!(channel = ?id, "Client finished sending");
                break;
            }
            _ => {}
        }
    }

    let _ = writer.shutdown().await;
}
