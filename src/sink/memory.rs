//! In-memory response sink
//!
//! Captures everything written to it. Used to collect a response without a
//! network connection, and by the test suites as a subscriber.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::ResponseSink;
use crate::error::SinkError;

/// Sink that records status, headers and chunks
pub struct MemorySink {
    status: Mutex<Option<StatusCode>>,
    headers: Mutex<HeaderMap>,
    chunks: Mutex<Vec<Bytes>>,
    /// Refuse writes while set
    failing: AtomicBool,
    /// Number of attempted writes, including refused ones
    attempts: AtomicU64,
    written: watch::Sender<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        let (written, _) = watch::channel(0);
        Self {
            status: Mutex::new(None),
            headers: Mutex::new(HeaderMap::new()),
            chunks: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            written,
        }
    }

    /// A sink whose writes all fail with [`SinkError::Closed`]
    pub fn failing() -> Self {
        let sink = Self::new();
        sink.set_failing(true);
        sink
    }

    /// Toggle write failures
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Chunks accepted so far
    pub fn chunks(&self) -> Vec<Bytes> {
        self.chunks.lock().clone()
    }

    /// All accepted chunks concatenated
    pub fn body(&self) -> Bytes {
        let chunks = self.chunks.lock();
        let mut body = BytesMut::new();
        for chunk in chunks.iter() {
            body.extend_from_slice(chunk);
        }
        body.freeze()
    }

    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.headers.lock().get(name).cloned()
    }

    /// Number of `write` calls seen, successful or not
    pub fn write_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` chunks have been accepted
    pub async fn wait_for_chunks(&self, count: usize) {
        let mut rx = self.written.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        if self.status.lock().is_none() {
            self.headers.lock().insert(name, value);
        }
    }

    fn write_header(&self, status: StatusCode) {
        let mut current = self.status.lock();
        if current.is_none() {
            *current = Some(status);
        }
    }

    fn status(&self) -> Option<StatusCode> {
        *self.status.lock()
    }

    async fn write(&self, chunk: Bytes) -> Result<usize, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        self.write_header(StatusCode::OK);
        let len = chunk.len();
        let count = {
            let mut chunks = self.chunks.lock();
            chunks.push(chunk);
            chunks.len()
        };
        self.written.send_replace(count);
        Ok(len)
    }
}
