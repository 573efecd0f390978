//! Output sinks for the reserved descriptors.
//!
//! Writes to fds 1 and 2 never reach the filesystem; they are routed to a
//! sink injected by the embedder. Sinks receive text defensively (invalid
//! UTF-8 is replaced) and must not fail.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

pub trait OutputSink: Send {
    fn write_text(&mut self, text: &str);
}

/// A cloneable handle to a sink, shareable between the host functions and
/// the embedder.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<dyn OutputSink>>,
}

impl fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSink")
    }
}

impl SharedSink {
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Decode `bytes` and hand the text to the sink.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        self.inner.lock().unwrap().write_text(&text);
    }

    pub fn write_text(&self, text: &str) {
        self.inner.lock().unwrap().write_text(text);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_text(&mut self, _text: &str) {}
}

/// Accumulates output for later inspection.
#[derive(Debug, Default)]
pub struct CaptureSink {
    buffer: Arc<Mutex<String>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle onto the same buffer, to keep after the sink has
    /// been handed off.
    pub fn buffer(&self) -> CaptureBuffer {
        CaptureBuffer {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl OutputSink for CaptureSink {
    fn write_text(&mut self, text: &str) {
        self.buffer.lock().unwrap().push_str(text);
    }
}

#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    buffer: Arc<Mutex<String>>,
}

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }
}

/// Forwards to the host's stdout.
#[derive(Debug, Default)]
pub struct HostStdout;

impl OutputSink for HostStdout {
    fn write_text(&mut self, text: &str) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(text.as_bytes());
        let _ = lock.flush();
    }
}

/// Forwards to the host's stderr.
#[derive(Debug, Default)]
pub struct HostStderr;

impl OutputSink for HostStderr {
    fn write_text(&mut self, text: &str) {
        let stderr = std::io::stderr();
        let mut lock = stderr.lock();
        let _ = lock.write_all(text.as_bytes());
        let _ = lock.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_accumulates_text() {
        let sink = CaptureSink::new();
        let buffer = sink.buffer();
        let shared = SharedSink::new(sink);

        shared.write_bytes(b"hello\n");
        shared.write_text("world");
        assert_eq!(buffer.contents(), "hello\nworld");
        assert_eq!(buffer.take(), "hello\nworld");
        assert_eq!(buffer.contents(), "");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let sink = CaptureSink::new();
        let buffer = sink.buffer();
        let shared = SharedSink::new(sink);

        shared.write_bytes(&[0x68, 0x69, 0xFF]);
        assert!(buffer.contents().starts_with("hi"));
    }
}
