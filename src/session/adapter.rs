//! Stream adapter
//!
//! The upstream transport writes its response into a [`ResponseSink`] as if a
//! client were on the other end. The adapter is that sink: each write becomes
//! one chunk handed to the session's broadcast loop.
//!
//! The channel holds a single chunk, so a write waits until the broadcast
//! loop has taken the previous one. A slow broadcast therefore slows the
//! upstream read instead of buffering without bound.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::sink::ResponseSink;

/// Response sink that turns upstream writes into broadcast chunks
///
/// Status and headers are recorded but go nowhere: subscribers get their own
/// status when they attach.
pub struct StreamAdapter {
    status: Mutex<Option<StatusCode>>,
    headers: Mutex<HeaderMap>,
    tx: mpsc::Sender<Bytes>,
}

impl StreamAdapter {
    /// Create an adapter and the receiving end for the broadcast loop
    pub fn new() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(1);
        let adapter = Self {
            status: Mutex::new(None),
            headers: Mutex::new(HeaderMap::new()),
            tx,
        };
        (adapter, rx)
    }

    /// Headers the upstream set on its response
    pub fn headers(&self) -> HeaderMap {
        self.headers.lock().clone()
    }
}

#[async_trait]
impl ResponseSink for StreamAdapter {
    fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.headers.lock().insert(name, value);
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
        let len = chunk.len();
        self.tx.send(chunk).await.map_err(|_| SinkError::Closed)?;
        Ok(len)
    }
}
