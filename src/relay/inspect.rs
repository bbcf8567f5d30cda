//! Frame inspection strategies for the server-to-client direction.

use tracing::debug;

use crate::protocol::Frame;

/// Looks at (and may replace) every frame the upstream sends during the
/// framed phase. Implementations must return promptly.
pub trait Inspector: Send + Sync {
    fn inspect(&self, frame: Frame) -> Frame;
}

impl<F> Inspector for F
where
    F: Fn(Frame) -> Frame + Send + Sync,
{
    fn inspect(&self, frame: Frame) -> Frame {
        self(frame)
    }
}

/// Logs each payload and passes it through untouched.
#[derive(Debug, Clone, Default)]
pub struct LoggingInspector {
    session_id: String,
}

impl LoggingInspector {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl Inspector for LoggingInspector {
    fn inspect(&self, frame: Frame) -> Frame {
        debug!(
            session_id = %self.session_id,
            len = frame.len(),
            "pkt-line: {}",
            frame.text()
        );
        frame
    }
}

/// Passes frames through without logging them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Inspector for PassThrough {
    fn inspect(&self, frame: Frame) -> Frame {
        frame
    }
}
