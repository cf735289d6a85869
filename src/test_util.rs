//! Fakes shared by the unit tests

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proxy::Handler;
use crate::request::{ProxyRequest, RequestInfo};
use crate::sink::ResponseSink;
use crate::status::ApiStatus;

/// What the fake upstream should do next
pub(crate) enum Feed {
    Chunk(Bytes),
    Fail(String),
}

/// Upstream whose watch stream is driven by the test
///
/// The first round trip consumes the feed; later round trips stay open and
/// silent until they are aborted.
pub(crate) struct FeedUpstream {
    feed: Mutex<Option<mpsc::UnboundedReceiver<Feed>>>,
    calls: AtomicUsize,
    uris: Mutex<Vec<String>>,
}

/// Test-side handle pushing into a [`FeedUpstream`]
pub(crate) struct FeedHandle(mpsc::UnboundedSender<Feed>);

impl FeedHandle {
    pub fn chunk(&self, data: &'static [u8]) {
        let _ = self.0.send(Feed::Chunk(Bytes::from_static(data)));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.0.send(Feed::Fail(message.to_string()));
    }
}

impl FeedUpstream {
    pub fn new() -> (Arc<Self>, FeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            feed: Mutex::new(Some(rx)),
            calls: AtomicUsize::new(0),
            uris: Mutex::new(Vec::new()),
        });
        (upstream, FeedHandle(tx))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }
}

#[async_trait]
impl Handler for FeedUpstream {
    async fn serve(&self, req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uris.lock().push(req.uri().to_string());

        let feed = self.feed.lock().take();
        let Some(mut feed) = feed else {
            std::future::pending::<()>().await;
            return Ok(());
        };

        sink.write_header(StatusCode::OK);
        while let Some(item) = feed.recv().await {
            match item {
                Feed::Chunk(chunk) => {
                    if sink.write(chunk).await.is_err() {
                        break;
                    }
                }
                Feed::Fail(message) => {
                    return Err(Error::Api(ApiStatus::service_unavailable(message)));
                }
            }
        }
        Ok(())
    }
}

/// Handler answering every request with a fixed body, counting calls
pub(crate) struct StaticHandler {
    body: &'static [u8],
    calls: AtomicUsize,
}

impl StaticHandler {
    pub fn new(body: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            body,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for StaticHandler {
    async fn serve(&self, _req: ProxyRequest, sink: Arc<dyn ResponseSink>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sink.write_header(StatusCode::OK);
        sink.write(Bytes::from_static(self.body)).await?;
        Ok(())
    }
}

/// Build a request carrying resolved metadata
pub(crate) fn resource_request(info: RequestInfo) -> ProxyRequest {
    let mut req = http::Request::builder()
        .uri("/")
        .body(Bytes::new())
        .unwrap_or_default();
    req.extensions_mut().insert(info);
    req
}

/// Poll `condition` until it holds, failing the test after two seconds
pub(crate) async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Run `future` with a two second timeout
pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(2), future).await {
        Ok(value) => value,
        Err(_) => panic!("future did not complete in time"),
    }
}
