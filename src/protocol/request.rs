//! SSH channel requests as seen by the session controller.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::ChannelError;
use crate::protocol::constants::*;

/// A channel request awaiting an accept/reject reply.
///
/// Dropping the request without calling [`ChannelRequest::reply`] sends no
/// reply at all.
#[derive(Debug)]
pub struct ChannelRequest {
    kind: String,
    payload: Bytes,
    responder: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// Create a request and the receiver its reply will arrive on.
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            payload: payload.into(),
            responder: Some(tx),
        };
        (request, rx)
    }

    /// Build an `exec` request whose payload is the command as an SSH
    /// `string` (4 byte big-endian length, then the bytes).
    pub fn exec(command: &[u8]) -> (Self, oneshot::Receiver<bool>) {
        Self::with_strings(REQUEST_EXEC, &[command])
    }

    /// Build a request whose payload is a sequence of SSH `string` fields,
    /// e.g. the name and value of an `env` request.
    pub fn with_strings(kind: impl Into<String>, fields: &[&[u8]]) -> (Self, oneshot::Receiver<bool>) {
        let len: usize = fields.iter().map(|f| SSH_STRING_PREFIX_LEN + f.len()).sum();
        let mut payload = BytesMut::with_capacity(len);
        for field in fields {
            payload.put_u32(field.len() as u32);
            payload.put_slice(field);
        }
        Self::new(kind, payload.freeze())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Extract the command text of an `exec` request.
    pub fn command(&self) -> Result<String, ChannelError> {
        if self.kind != REQUEST_EXEC {
            return Err(ChannelError::UnsupportedRequestType(self.kind.clone()));
        }

        let malformed = |reason| ChannelError::MalformedPayload {
            kind: self.kind.clone(),
            reason,
        };

        if self.payload.len() < SSH_STRING_PREFIX_LEN {
            return Err(malformed("missing length prefix"));
        }

        let (prefix, rest) = self.payload.split_at(SSH_STRING_PREFIX_LEN);
        let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let command = &rest[..declared.min(rest.len())];

        String::from_utf8(command.to_vec()).map_err(|_| malformed("command is not valid UTF-8"))
    }

    /// Send the reply. Only the first call has any effect.
    pub fn reply(&mut self, accept: bool) {
        if let Some(responder) = self.responder.take() {
            // The requester may have gone away; nothing to do then.
            let _ = responder.send(accept);
        }
    }
}
