//! Relay Engine

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ByteSink, Inspector, LoggingInspector, RelayStats, RelaySummary};
use crate::error::RelayError;
use crate::protocol::constants::{PKT_FLUSH, PKT_MAX_PAYLOAD};
use crate::protocol::pktline::{self, Packet};
use crate::protocol::Frame;

/// Default buffer between a pipe's writable end and its relay task.
pub const DEFAULT_PIPE_CAPACITY: usize = 8 * 1024;

/// Writable end of a relay pipe. Shut it down (or drop it) to signal the
/// end of the stream.
pub type PipeWriter = DuplexStream;

/// How a server pipe is currently forwarding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Decoding pkt-lines and passing each through the inspector.
    Framed,
    /// Copying bytes verbatim after the first flush packet.
    Raw,
}

type RelayTask = JoinHandle<Result<(), RelayError>>;

/// Relays one command's byte streams between the client and upstream.
///
/// Bytes written to [`RelayEngine::client_pipe`] go verbatim to the upstream
/// sink. Bytes written to [`RelayEngine::server_pipe`] are decoded as
/// pkt-lines, inspected and re-encoded toward the client until the first
/// flush packet, then copied verbatim.
pub struct RelayEngine {
    toward_client: Arc<dyn ByteSink>,
    toward_upstream: Arc<dyn ByteSink>,
    inspector: Arc<dyn Inspector>,
    pipe_capacity: usize,
    stats: Arc<RelayStats>,
    closed: watch::Sender<bool>,
    client_tasks: Vec<RelayTask>,
    server_tasks: Vec<RelayTask>,
}

impl RelayEngine {
    /// Create a relay engine that logs every frame.
    pub fn new(
        session_id: impl Into<String>,
        toward_client: Arc<dyn ByteSink>,
        toward_upstream: Arc<dyn ByteSink>,
    ) -> Self {
        let session_id = session_id.into();
        let (closed, _) = watch::channel(false);

        Self {
            toward_client,
            toward_upstream,
            inspector: Arc::new(LoggingInspector::new(session_id.clone())),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            stats: Arc::new(RelayStats::new(session_id)),
            closed,
            client_tasks: Vec::new(),
            server_tasks: Vec::new(),
        }
    }

    /// Replace the frame inspector. Applies to server pipes created afterwards.
    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Open a pipe relayed verbatim toward upstream.
    pub fn client_pipe(&mut self) -> PipeWriter {
        let (writer, mut reader) = tokio::io::duplex(self.pipe_capacity);
        let sink = Arc::clone(&self.toward_upstream);
        let stats = Arc::clone(&self.stats);
        let mut closed = self.closed.subscribe();

        self.client_tasks.push(tokio::spawn(async move {
            let result = copy_raw(&mut reader, sink.as_ref(), &mut closed, |n| {
                stats.add_bytes_up(n)
            })
            .await;

            debug!(session_id = %stats.session_id, "ClientPipe exited, closing upstream");
            sink.close().await;
            result
        }));

        writer
    }

    /// Open a pipe whose pkt-lines are inspected on the way to the client.
    pub fn server_pipe(&mut self) -> PipeWriter {
        let (writer, reader) = tokio::io::duplex(self.pipe_capacity);
        let sink = Arc::clone(&self.toward_client);
        let inspector = Arc::clone(&self.inspector);
        let stats = Arc::clone(&self.stats);
        let closed = self.closed.subscribe();

        self.server_tasks.push(tokio::spawn(run_server_pipe(
            reader, sink, inspector, stats, closed,
        )));

        writer
    }

    /// Close both sinks and stop all relay tasks. Safe to call repeatedly.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        self.toward_client.close().await;
        self.toward_upstream.close().await;
    }

    /// Wait for the upstream-to-client direction to drain, then shut the
    /// engine down and collect the result of both directions.
    ///
    /// Once the server side is done the client side is cut off; a client
    /// pipe that hits an already closed upstream is not treated as a failure.
    pub async fn finish(mut self) -> Result<RelaySummary, RelayError> {
        let mut first_error = None;

        for task in self.server_tasks.drain(..) {
            if let Err(e) = join(task).await {
                warn!(session_id = %self.stats.session_id, error = %e, "Server relay failed");
                first_error.get_or_insert(e);
            }
        }

        self.close().await;

        for task in self.client_tasks.drain(..) {
            match join(task).await {
                Ok(()) => {}
                Err(RelayError::SinkClosed) => {
                    debug!(session_id = %self.stats.session_id, "Upstream closed before client finished");
                }
                Err(e) => {
                    warn!(session_id = %self.stats.session_id, error = %e, "Client relay failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.stats.log_stats();

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.stats.summary()),
        }
    }
}

async fn join(task: RelayTask) -> Result<(), RelayError> {
    task.await
        .map_err(|e| RelayError::TaskFailed(e.to_string()))?
}

/// Decode loop behind a server pipe.
async fn run_server_pipe(
    mut reader: DuplexStream,
    sink: Arc<dyn ByteSink>,
    inspector: Arc<dyn Inspector>,
    stats: Arc<RelayStats>,
    mut closed: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let mut mode = RelayMode::Framed;
    let mut buf = vec![0u8; PKT_MAX_PAYLOAD];

    let result = loop {
        let packet = tokio::select! {
            packet = pktline::read_packet(&mut reader, &mut buf) => packet,
            _ = closed_signal(&mut closed) => break Ok(()),
        };

        match packet {
            Ok(Some(Packet::Data(n))) => {
                stats.record_frame();
                let frame = inspector.inspect(Frame::new(Bytes::copy_from_slice(&buf[..n])));
                let encoded = match pktline::encode(frame.payload()) {
                    Ok(encoded) => encoded,
                    Err(e) => break Err(RelayError::EncodeFailed(e)),
                };
                if let Err(e) = sink.write_all(&encoded).await {
                    break Err(e);
                }
                stats.add_bytes_down(encoded.len() as u64);
            }
            Ok(Some(Packet::Flush)) => {
                stats.record_flush();
                if let Err(e) = sink.write_all(PKT_FLUSH).await {
                    break Err(e);
                }
                stats.add_bytes_down(PKT_FLUSH.len() as u64);

                mode = RelayMode::Raw;
                debug!(session_id = %stats.session_id, "Flush packet seen, relaying raw");
                break copy_raw(&mut reader, sink.as_ref(), &mut closed, |n| {
                    stats.add_bytes_down(n)
                })
                .await;
            }
            Ok(None) => break Ok(()),
            Err(e) => {
                warn!(session_id = %stats.session_id, error = %e, "Malformed pkt-line from upstream");
                break Err(RelayError::DecodeFailed(e));
            }
        }
    };

    // Dropping the reader makes further writes to the pipe fail.
    drop(reader);
    debug!(session_id = %stats.session_id, ?mode, "ServerPipe exited, closing client");
    sink.close().await;
    result
}

/// Copy everything from `reader` into `sink` until end of stream or engine
/// shutdown.
async fn copy_raw<R, F>(
    reader: &mut R,
    sink: &dyn ByteSink,
    closed: &mut watch::Receiver<bool>,
    count: F,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; DEFAULT_PIPE_CAPACITY];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(RelayError::ReadFailed(e)),
            },
            _ = closed_signal(closed) => return Ok(()),
        };

        sink.write_all(&buf[..n]).await?;
        count(n as u64);
    }
}

/// Resolves once the engine is closed or dropped.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
