//! Error types for the proxy core.
//!
//! Startup and configuration code uses `anyhow` (see [`crate::Result`]);
//! everything that runs per connection returns one of the typed errors
//! below so a failure stays scoped to its own session.

use std::io;

use thiserror::Error;

/// Errors produced while encoding or decoding pkt-line frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended after 1..=3 header bytes.
    #[error("malformed pkt-line header: got {read} of 4 bytes")]
    MalformedHeader { read: usize },

    /// The header contained characters other than hex digits.
    #[error("malformed pkt-line header: {header:?} is not hexadecimal")]
    InvalidHex { header: [u8; 4] },

    /// Header values 1..=3 cannot describe a payload.
    #[error("invalid pkt-line size {size}")]
    InvalidSize { size: u16 },

    /// Fewer payload bytes were available than the header declared.
    #[error("short pkt-line payload: read {read} of {expected} bytes")]
    ShortBuffer { read: usize, expected: usize },

    /// Payload does not fit in a single frame.
    #[error("pkt-line payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// The destination accepted only part of a frame.
    #[error("short write while emitting pkt-line")]
    ShortWrite,

    /// Underlying I/O failure.
    #[error("pkt-line I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A write was attempted after the sink was closed.
    #[error("sink closed")]
    SinkClosed,

    /// The destination rejected a write.
    #[error("write to destination failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// Reading from a pipe failed for a reason other than end of stream.
    #[error("read from pipe failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// The framed decode phase hit a non-recoverable frame error.
    #[error("pkt-line decode failed: {0}")]
    DecodeFailed(#[source] FrameError),

    /// A frame returned by the inspector could not be re-encoded.
    #[error("pkt-line encode failed: {0}")]
    EncodeFailed(#[source] FrameError),

    /// A relay task panicked or was cancelled.
    #[error("relay task failed: {0}")]
    TaskFailed(String),
}

/// Errors that terminate a single proxied session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported command {0:?}")]
    UnsupportedCommand(String),

    #[error("failed to reach upstream: {0}")]
    UpstreamDialFailed(String),

    #[error("upstream session failed: {0}")]
    UpstreamSessionFailed(String),

    #[error("remote command exited with status {0}")]
    RemoteCommandFailed(u32),

    #[error("remote command killed by signal {0}")]
    RemoteCommandSignaled(String),

    /// The inbound channel no longer has its byte streams available.
    #[error("inbound channel streams unavailable")]
    ChannelUnavailable,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Errors raised while interpreting a channel request.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unsupported channel request type {0:?}")]
    UnsupportedRequestType(String),

    #[error("malformed {kind} request payload: {reason}")]
    MalformedPayload { kind: String, reason: &'static str },
}

impl SessionError {
    /// Exit status to report back to the inbound client, when the upstream
    /// produced one.
    pub fn exit_status(&self) -> Option<u32> {
        match self {
            SessionError::RemoteCommandFailed(status) => Some(*status),
            _ => None,
        }
    }
}
