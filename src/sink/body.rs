//! Sink backed by a streaming hyper response body
//!
//! The listener cannot hand hyper a response until it knows the status, so
//! the head is delivered separately through a oneshot as soon as it is
//! committed. Body chunks flow through a bounded mpsc channel into a
//! [`SinkBody`]. When hyper drops the body (client went away) the request's
//! cancellation token fires, which detaches any watch subscriber writing here.
//!
//! A handler that returns without writing anything is closed with
//! [`BodySink::finish`]. A sink dropped before a head was committed (the
//! handler panicked or was aborted) closes the head channel empty instead.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body::{Body, Frame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::ResponseSink;
use crate::error::SinkError;

/// Status and headers of a response, available before the body
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

struct HeadState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    tx: Option<oneshot::Sender<ResponseHead>>,
}

/// Sink that feeds a [`SinkBody`]
pub struct BodySink {
    head: Mutex<HeadState>,
    tx: mpsc::Sender<Bytes>,
}

impl BodySink {
    /// Create a connected sink, head receiver, and body
    ///
    /// `capacity` bounds how many chunks may be queued ahead of the client.
    /// Dropping the returned body cancels `cancel`.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<ResponseHead>, SinkBody) {
        let (head_tx, head_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let sink = Self {
            head: Mutex::new(HeadState {
                status: None,
                headers: HeaderMap::new(),
                tx: Some(head_tx),
            }),
            tx,
        };
        let body = SinkBody {
            rx,
            _guard: cancel.drop_guard(),
        };

        (sink, head_rx, body)
    }

    /// Commit `200 OK` if the handler never committed a status
    pub fn finish(&self) {
        self.commit(StatusCode::OK);
    }

    fn commit(&self, status: StatusCode) {
        let mut head = self.head.lock();
        if head.status.is_some() {
            return;
        }
        head.status = Some(status);
        let headers = std::mem::take(&mut head.headers);
        if let Some(tx) = head.tx.take() {
            // Receiver gone means the connection is gone; writes will fail next
            let _ = tx.send(ResponseHead { status, headers });
        }
    }
}

#[async_trait]
impl ResponseSink for BodySink {
    fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        let mut head = self.head.lock();
        if head.status.is_none() {
            head.headers.insert(name, value);
        }
    }

    fn write_header(&self, status: StatusCode) {
        self.commit(status);
    }

    fn status(&self) -> Option<StatusCode> {
        self.head.lock().status
    }

    async fn write(&self, chunk: Bytes) -> Result<usize, SinkError> {
        self.commit(StatusCode::OK);
        let len = chunk.len();
        self.tx.send(chunk).await.map_err(|_| SinkError::Closed)?;
        Ok(len)
    }
}

/// Response body fed by a [`BodySink`]
pub struct SinkBody {
    rx: mpsc::Receiver<Bytes>,
    _guard: DropGuard,
}

impl Body for SinkBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}
