//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use gitspy::error::RelayError;
use gitspy::relay::ByteSink;

/// Collects everything written to it.
#[derive(Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<usize>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Size of each individual write, in order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write_all(&self, data: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::SinkClosed);
        }
        self.data.lock().unwrap().extend_from_slice(data);
        self.writes.lock().unwrap().push(data.len());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Encode `payload` as a pkt-line, panicking on oversized input.
pub fn pkt(payload: &[u8]) -> Vec<u8> {
    gitspy::protocol::pktline::encode(payload).unwrap().to_vec()
}
