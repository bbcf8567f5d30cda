//! Closable byte sinks the relay engine writes into.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::RelayError;

/// Destination for one relay direction.
///
/// After [`ByteSink::close`] every write fails with [`RelayError::SinkClosed`].
/// `close` is idempotent.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write_all(&self, data: &[u8]) -> Result<(), RelayError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A sink backed by a bounded channel of byte chunks.
///
/// Each write waits for a free slot, so a slow consumer holds back the
/// producer. Closing drops the sender, which the consumer sees as the end of
/// the stream.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a sink together with the receiving end.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    async fn write_all(&self, data: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::SinkClosed);
        }
        if data.is_empty() {
            return Ok(());
        }

        let tx = {
            let guard = self.tx.lock().await;
            guard.clone().ok_or(RelayError::SinkClosed)?
        };

        // A dropped receiver means the other side is gone for good.
        tx.send(Bytes::copy_from_slice(data)).await.map_err(|_| {
            self.closed.store(true, Ordering::Release);
            RelayError::SinkClosed
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().await.take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
