//! pkt-line codec
//!
//! Every frame is a 4 character lowercase hex length (covering the header
//! itself) followed by the payload. `0000` is the flush packet and carries
//! no payload; lengths 1..=3 are invalid.
//!
//! See <https://git-scm.com/docs/protocol-common#_pkt_line_format>.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::protocol::constants::*;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// One decoded pkt-line payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text for logging, without the trailing newline git adds.
    pub fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        text.trim_end_matches('\n').to_string()
    }
}

/// Outcome of reading one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// A data packet whose payload now occupies `buf[..n]`.
    Data(usize),
    /// The `0000` flush packet.
    Flush,
}

fn header_for(payload_len: usize) -> Result<[u8; 4], FrameError> {
    if payload_len > PKT_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: PKT_MAX_PAYLOAD,
        });
    }

    let total = payload_len + PKT_HEADER_LEN;
    Ok([
        HEX_DIGITS[(total >> 12) & 0xf],
        HEX_DIGITS[(total >> 8) & 0xf],
        HEX_DIGITS[(total >> 4) & 0xf],
        HEX_DIGITS[total & 0xf],
    ])
}

/// Append one framed payload to `dst`.
///
/// Payloads longer than [`PKT_MAX_PAYLOAD`] are rejected rather than split,
/// since splitting would change the packet boundaries the peer sees.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let header = header_for(payload.len())?;
    dst.reserve(PKT_HEADER_LEN + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Encode a single frame.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(PKT_HEADER_LEN + payload.len());
    encode_into(payload, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode the flush packet.
pub fn encode_flush() -> Bytes {
    Bytes::from_static(PKT_FLUSH)
}

/// Write one frame to `w`, returning the number of bytes written.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = header_for(payload.len())?;
    write_all(w, &header).await?;
    write_all(w, payload).await?;
    Ok(header.len() + payload.len())
}

/// Write the flush packet to `w`.
pub async fn write_flush<W>(w: &mut W) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_all(w, PKT_FLUSH).await?;
    Ok(PKT_FLUSH.len())
}

async fn write_all<W>(w: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(data).await.map_err(|e| match e.kind() {
        io::ErrorKind::WriteZero => FrameError::ShortWrite,
        _ => FrameError::Io(e),
    })
}

/// Read one packet from `r` into `buf`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a packet boundary.
/// End of stream inside the payload is only reported through the
/// [`FrameError::ShortBuffer`] check, as is a `buf` smaller than the
/// declared payload.
pub async fn read_packet<R>(r: &mut R, buf: &mut [u8]) -> Result<Option<Packet>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PKT_HEADER_LEN];
    let read = read_up_to(r, &mut header).await?;
    match read {
        0 => return Ok(None),
        n if n < PKT_HEADER_LEN => return Err(FrameError::MalformedHeader { read: n }),
        _ => {}
    }

    let size = parse_header(&header)?;
    if size == 0 {
        return Ok(Some(Packet::Flush));
    }
    if (size as usize) < PKT_HEADER_LEN {
        return Err(FrameError::InvalidSize { size });
    }

    let expected = size as usize - PKT_HEADER_LEN;
    let limit = expected.min(buf.len());
    let n = read_up_to(r, &mut buf[..limit]).await?;
    if n < expected {
        return Err(FrameError::ShortBuffer { read: n, expected });
    }

    Ok(Some(Packet::Data(n)))
}

/// Parse a 4 byte hex header. Upper case digits are accepted on input.
pub fn parse_header(header: &[u8; 4]) -> Result<u16, FrameError> {
    let mut size: u16 = 0;
    for &b in header {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(FrameError::InvalidHex { header: *header }),
        };
        size = (size << 4) | u16::from(digit);
    }
    Ok(size)
}

/// Fill as much of `buf` as possible, stopping early only at end of stream.
async fn read_up_to<R>(r: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
