//! Relay Session Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

/// Byte and frame counters shared by the tasks of one relay engine.
#[derive(Debug)]
pub struct RelayStats {
    pub session_id: String,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    frames: AtomicU64,
    flushes: AtomicU64,
}

/// Snapshot of [`RelayStats`] taken when a relay finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub session_id: String,
    pub duration: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub frames: u64,
    pub flushes: u64,
}

impl RelayStats {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Bytes relayed client to upstream
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed upstream to client, framing included
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("gitspy_relay_bytes_total", bytes, "direction" => "upstream");
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("gitspy_relay_bytes_total", bytes, "direction" => "client");
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("gitspy_pkt_lines_total");
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn summary(&self) -> RelaySummary {
        RelaySummary {
            session_id: self.session_id.clone(),
            duration: self.duration(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            frames: self.frames(),
            flushes: self.flushes(),
        }
    }

    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            frames = self.frames(),
            flushes = self.flushes(),
            "Relay finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RelayStats::new("test_session");
        assert_eq!(stats.bytes_up(), 0);
        assert_eq!(stats.bytes_down(), 0);

        stats.add_bytes_up(100);
        stats.add_bytes_up(24);
        stats.add_bytes_down(2048);
        stats.record_frame();
        stats.record_frame();
        stats.record_flush();

        let summary = stats.summary();
        assert_eq!(summary.session_id, "test_session");
        assert_eq!(summary.bytes_up, 124);
        assert_eq!(summary.bytes_down, 2048);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.flushes, 1);
    }
}
