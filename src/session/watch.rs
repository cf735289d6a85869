//! Watch session: one upstream stream fanned out to many subscribers
//!
//! ```text
//!              upstream round trip task
//!   Handler::serve(watch request, StreamAdapter)
//!                         │  write() (one chunk in flight)
//!                         ▼
//!                  broadcast loop ── chunk i to every subscriber,
//!                         │          then read chunk i+1
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!     subscriber A   subscriber B   subscriber C
//!     (attach task)  (attach task)  (attach task)
//! ```
//!
//! The subscriber set has its own lock. It is taken only to mutate the set or
//! to snapshot it; writes to subscribers happen with no lock held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderValue, TRANSFER_ENCODING};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::adapter::StreamAdapter;
use super::state::{SessionPhase, SessionState};
use crate::error::{Error, Result};
use crate::proxy::Handler;
use crate::registry::ResourceKey;
use crate::request::{ClientComponent, ProxyRequest, RequestInfo, Verb};
use crate::sink::ResponseSink;
use crate::stats::{SessionCounters, SessionStats};

#[derive(Clone)]
struct Subscriber {
    sink: Arc<dyn ResponseSink>,
    cancel: CancellationToken,
}

/// One upstream watch connection and its subscribers
pub struct WatchSession {
    key: ResourceKey,
    info: RequestInfo,
    upstream: Arc<dyn Handler>,
    /// Prepared upstream request, taken when the session starts
    request: Mutex<Option<ProxyRequest>>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    state: Mutex<SessionState>,
    /// Top-level cancellation; stops the upstream round trip
    cancel: CancellationToken,
    /// Fires once the session is terminated
    done: CancellationToken,
    counters: SessionCounters,
    created_at: Instant,
}

impl WatchSession {
    /// Prepare a session for `info`
    ///
    /// Fails if the upstream watch request cannot be built; nothing is started
    /// in that case. `cancel` is the session's top-level token.
    pub fn new(
        key: ResourceKey,
        info: RequestInfo,
        component: &str,
        watch_query: &str,
        upstream: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let request = build_watch_request(&info, component, watch_query, cancel.child_token())?;

        Ok(Self {
            key,
            info,
            upstream,
            request: Mutex::new(Some(request)),
            subscribers: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::new()),
            cancel,
            done: CancellationToken::new(),
            counters: SessionCounters::new(),
            created_at: Instant::now(),
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Metadata of the request that created the session
    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().is_terminated()
    }

    /// Number of subscribers attached right now
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Stop the session; attached subscribers are released with an error
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session has terminated
    pub async fn terminated(&self) {
        self.done.cancelled().await;
    }

    /// Snapshot of the session's statistics
    pub fn stats(&self) -> SessionStats {
        let (phase, termination_reason, streaming_for) = {
            let state = self.state.lock();
            (state.phase, state.reason.clone(), state.streaming_for())
        };

        SessionStats {
            key: self.key.clone(),
            phase,
            subscriber_count: self.subscriber_count(),
            subscribers_attached: self.counters.subscribers_attached(),
            chunks_broadcast: self.counters.chunks_broadcast(),
            bytes_broadcast: self.counters.bytes_broadcast(),
            deliveries: self.counters.deliveries(),
            write_failures: self.counters.write_failures(),
            age: self.created_at.elapsed(),
            streaming_for,
            termination_reason,
        }
    }

    /// Run the upstream round trip and the broadcast loop until the session terminates
    ///
    /// Returns immediately if the session was already started.
    pub async fn run(self: Arc<Self>) {
        let request = self.request.lock().take();
        let Some(request) = request else {
            return;
        };
        let started = self.state.lock().start();
        if !started {
            return;
        }

        tracing::info!(key = %self.key, uri = %request.uri(), "Watch session streaming");

        let (adapter, mut chunks) = StreamAdapter::new();
        let sink: Arc<dyn ResponseSink> = Arc::new(adapter);
        let upstream = Arc::clone(&self.upstream);
        let mut round_trip = tokio::spawn(async move { upstream.serve(request, sink).await });

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "session cancelled".to_string(),
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        if !self.broadcast(chunk).await {
                            break "session cancelled".to_string();
                        }
                    }
                    // Adapter dropped: the round trip is finishing
                    None => break round_trip_reason((&mut round_trip).await),
                },
                result = &mut round_trip => {
                    // Deliver what the upstream wrote before it returned
                    while let Ok(chunk) = chunks.try_recv() {
                        if !self.broadcast(chunk).await {
                            break;
                        }
                    }
                    break round_trip_reason(result);
                }
            }
        };

        // Releases the adapter if the round trip is still running
        round_trip.abort();
        drop(chunks);
        self.terminate(reason);
    }

    /// Attach a subscriber and block until it goes away
    ///
    /// Commits a chunked `200 OK` on the sink, then forwards every chunk
    /// broadcast from now on until `cancel` fires (returns `Ok`) or the
    /// session terminates (returns [`Error::SessionTerminated`]). A session
    /// that already terminated is reported without touching the sink.
    pub async fn attach(&self, sink: Arc<dyn ResponseSink>, cancel: CancellationToken) -> Result<()> {
        if self.is_terminated() {
            return Err(self.termination_error());
        }

        sink.insert_header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        sink.write_header(StatusCode::OK);

        let id = Uuid::new_v4();
        // Fires when the caller cancels or when this attach call ends
        let left = cancel.child_token();
        let subscribers = {
            let mut set = self.subscribers.lock();
            set.insert(
                id,
                Subscriber {
                    sink,
                    cancel: left.clone(),
                },
            );
            set.len()
        };
        let _registration = Registration {
            session: self,
            id,
            left,
        };
        self.counters.record_attach();

        tracing::debug!(key = %self.key, subscriber = %id, subscribers, "Subscriber attached");

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.done.cancelled() => Err(self.termination_error()),
        }
    }

    fn detach(&self, id: Uuid) {
        let remaining = {
            let mut set = self.subscribers.lock();
            set.remove(&id);
            set.len()
        };
        tracing::debug!(key = %self.key, subscriber = %id, subscribers = remaining, "Subscriber detached");
    }

    /// Write one chunk to every current subscriber, in turn
    ///
    /// A write is abandoned as soon as its subscriber leaves. Returns false
    /// if the session was cancelled before every subscriber was served.
    async fn broadcast(&self, chunk: Bytes) -> bool {
        self.counters.record_chunk(chunk.len());

        let targets: Vec<(Uuid, Subscriber)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.clone()))
            .collect();

        for (id, subscriber) in targets {
            // Detached while earlier subscribers were being written
            let attached = self.subscribers.lock().contains_key(&id);
            if !attached || subscriber.cancel.is_cancelled() {
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = subscriber.cancel.cancelled() => {
                    tracing::debug!(key = %self.key, subscriber = %id, "Subscriber left during write");
                    continue;
                }
                result = subscriber.sink.write(chunk.clone()) => result,
            };

            match result {
                Ok(_) => self.counters.record_delivery(),
                Err(e) => {
                    self.counters.record_write_failure();
                    tracing::warn!(
                        key = %self.key,
                        subscriber = %id,
                        error = %e,
                        "Subscriber write failed"
                    );
                }
            }
        }

        true
    }

    fn terminate(&self, reason: String) {
        self.state.lock().terminate(reason.clone());
        tracing::info!(
            key = %self.key,
            reason = %reason,
            subscribers = self.subscriber_count(),
            chunks = self.counters.chunks_broadcast(),
            "Watch session terminated"
        );
        self.done.cancel();
    }

    fn termination_error(&self) -> Error {
        let reason = self
            .state
            .lock()
            .reason
            .clone()
            .unwrap_or_else(|| "terminated".to_string());
        Error::SessionTerminated {
            key: self.key.to_string(),
            reason,
        }
    }
}

/// Removes a subscriber when its attach call ends, however it ends
struct Registration<'a> {
    session: &'a WatchSession,
    id: Uuid,
    left: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.session.detach(self.id);
        self.left.cancel();
    }
}

fn round_trip_reason(result: std::result::Result<Result<()>, JoinError>) -> String {
    match result {
        Ok(Ok(())) => "upstream watch closed".to_string(),
        Ok(Err(e)) => format!("upstream watch failed: {}", e),
        Err(e) if e.is_panic() => "upstream round trip panicked".to_string(),
        Err(_) => "upstream round trip aborted".to_string(),
    }
}

/// Canonical API path of the resource a request addresses
///
/// `/api/{version}` for the core group, `/apis/{group}/{version}` otherwise,
/// followed by `namespaces/{namespace}`, resource, name and subresource.
pub fn resource_path(info: &RequestInfo) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidWatchRequest {
        resource: describe(info),
        reason: reason.to_string(),
    };
    if info.resource.is_empty() {
        return Err(invalid("resource is empty"));
    }
    if info.api_version.is_empty() {
        return Err(invalid("api version is empty"));
    }

    let mut segments: Vec<&str> = Vec::with_capacity(8);
    if info.api_group.is_empty() {
        segments.extend(["api", info.api_version.as_str()]);
    } else {
        segments.extend(["apis", info.api_group.as_str(), info.api_version.as_str()]);
    }
    // A namespace object is addressed by name, not nested in itself
    if !info.namespace.is_empty() && info.resource != "namespaces" {
        segments.extend(["namespaces", info.namespace.as_str()]);
    }
    segments.push(&info.resource);
    if !info.name.is_empty() {
        segments.push(&info.name);
    }
    if !info.subresource.is_empty() {
        segments.push(&info.subresource);
    }

    if segments.iter().any(|s| s.contains('/')) {
        return Err(invalid("path segment contains '/'"));
    }
    Ok(format!("/{}", segments.join("/")))
}

fn build_watch_request(
    info: &RequestInfo,
    component: &str,
    watch_query: &str,
    cancel: CancellationToken,
) -> Result<ProxyRequest> {
    let path = resource_path(info)?;
    let uri = format!("{}?{}", path, watch_query);

    let mut request = http::Request::builder()
        .method(Method::GET)
        .uri(uri.as_str())
        .body(Bytes::new())
        .map_err(|e| Error::InvalidWatchRequest {
            resource: describe(info),
            reason: e.to_string(),
        })?;

    let mut watch_info = info.clone();
    watch_info.verb = Verb::Watch;
    watch_info.path = path;

    let extensions = request.extensions_mut();
    extensions.insert(watch_info);
    extensions.insert(ClientComponent(component.to_string()));
    extensions.insert(cancel);

    Ok(request)
}

fn describe(info: &RequestInfo) -> String {
    let mut out = info.resource.clone();
    if !info.api_group.is_empty() {
        out.push('.');
        out.push_str(&info.api_group);
    }
    if !info.namespace.is_empty() {
        out = format!("{}/{}", info.namespace, out);
    }
    if !info.name.is_empty() {
        out.push('/');
        out.push_str(&info.name);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::header::HeaderName;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::error::SinkError;
    use crate::sink::MemorySink;
    use crate::test_util::{wait_until, within, FeedHandle, FeedUpstream};

    /// Sink whose writes never complete, like a client that stopped reading
    #[derive(Default)]
    struct StalledSink {
        status: Mutex<Option<StatusCode>>,
        writes: AtomicUsize,
    }

    impl StalledSink {
        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResponseSink for StalledSink {
        fn insert_header(&self, _name: HeaderName, _value: HeaderValue) {}

        fn write_header(&self, status: StatusCode) {
            self.status.lock().get_or_insert(status);
        }

        fn status(&self) -> Option<StatusCode> {
            *self.status.lock()
        }

        async fn write(&self, _chunk: Bytes) -> std::result::Result<usize, SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn pods() -> RequestInfo {
        RequestInfo::resource(Verb::Watch, "", "v1", "pods").with_namespace("default")
    }

    fn session(upstream: Arc<FeedUpstream>) -> Arc<WatchSession> {
        Arc::new(
            WatchSession::new(
                ResourceKey::new("kubelet/pods.v1.core/default/"),
                pods(),
                "kubelet",
                "watch=true",
                upstream,
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    /// Start the session and attach `n` recording subscribers
    async fn started(
        n: usize,
    ) -> (
        Arc<WatchSession>,
        FeedHandle,
        Vec<(Arc<MemorySink>, CancellationToken)>,
    ) {
        let (upstream, feed) = FeedUpstream::new();
        let session = session(upstream);
        tokio::spawn(Arc::clone(&session).run());

        let mut subscribers = Vec::new();
        for _ in 0..n {
            subscribers.push(spawn_subscriber(&session));
        }
        wait_until(|| session.subscriber_count() == n).await;
        (session, feed, subscribers)
    }

    fn spawn_subscriber(session: &Arc<WatchSession>) -> (Arc<MemorySink>, CancellationToken) {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let session = Arc::clone(session);
        let (s, c) = (sink.clone(), cancel.clone());
        tokio::spawn(async move { session.attach(s, c).await });
        (sink, cancel)
    }

    #[test]
    fn test_resource_path_core_and_grouped() {
        assert_eq!(
            resource_path(&pods()).unwrap(),
            "/api/v1/namespaces/default/pods"
        );

        let info = RequestInfo::resource(Verb::Get, "apps", "v1", "deployments")
            .with_namespace("kube-system")
            .with_name("coredns")
            .with_subresource("scale");
        assert_eq!(
            resource_path(&info).unwrap(),
            "/apis/apps/v1/namespaces/kube-system/deployments/coredns/scale"
        );

        let ns = RequestInfo::resource(Verb::Get, "", "v1", "namespaces")
            .with_namespace("default")
            .with_name("default");
        assert_eq!(resource_path(&ns).unwrap(), "/api/v1/namespaces/default");
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let (upstream, _feed) = FeedUpstream::new();
        let info = RequestInfo::resource(Verb::Watch, "", "v1", "");
        let result = WatchSession::new(
            ResourceKey::new("k"),
            info,
            "kubelet",
            "watch=true",
            upstream.clone(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::InvalidWatchRequest { .. })));

        let info = RequestInfo::resource(Verb::Watch, "", "v1", "pods").with_name("bad name");
        let result = WatchSession::new(
            ResourceKey::new("k"),
            info,
            "kubelet",
            "watch=true",
            upstream.clone(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::InvalidWatchRequest { .. })));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_request_shape() {
        let (upstream, _feed) = FeedUpstream::new();
        let session = session(upstream.clone());
        assert_eq!(session.phase(), SessionPhase::Initializing);

        tokio::spawn(Arc::clone(&session).run());
        wait_until(|| upstream.calls() == 1).await;

        assert_eq!(session.phase(), SessionPhase::Streaming);
        assert_eq!(
            upstream.uris(),
            vec!["/api/v1/namespaces/default/pods?watch=true".to_string()]
        );
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (_session, feed, subscribers) = started(2).await;

        feed.chunk(b"c1");
        feed.chunk(b"c2");
        feed.chunk(b"c3");

        for (sink, _) in &subscribers {
            within(sink.wait_for_chunks(3)).await;
            let chunks = sink.chunks();
            assert_eq!(chunks, vec![&b"c1"[..], &b"c2"[..], &b"c3"[..]]);
            assert_eq!(sink.status(), Some(StatusCode::OK));
            assert_eq!(sink.header(&TRANSFER_ENCODING).unwrap(), "chunked");
        }
    }

    #[tokio::test]
    async fn test_late_attach_misses_earlier_chunks() {
        let (session, feed, subscribers) = started(1).await;
        let (early, _) = &subscribers[0];

        feed.chunk(b"c1");
        within(early.wait_for_chunks(1)).await;

        let (late, _late_cancel) = spawn_subscriber(&session);
        wait_until(|| session.subscriber_count() == 2).await;

        feed.chunk(b"c2");
        within(late.wait_for_chunks(1)).await;
        within(early.wait_for_chunks(2)).await;

        assert_eq!(late.chunks(), vec![&b"c2"[..]]);
        assert_eq!(early.chunks(), vec![&b"c1"[..], &b"c2"[..]]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let (session, feed, subscribers) = started(2).await;
        let (a, _) = &subscribers[0];
        let (b, _) = &subscribers[1];
        a.set_failing(true);

        feed.chunk(b"c1");
        feed.chunk(b"c2");
        within(b.wait_for_chunks(2)).await;

        assert_eq!(b.chunks(), vec![&b"c1"[..], &b"c2"[..]]);
        assert!(a.chunks().is_empty());
        wait_until(|| session.stats().write_failures == 2).await;
        assert_eq!(session.phase(), SessionPhase::Streaming);
    }

    #[tokio::test]
    async fn test_detach_stops_writes() {
        let (session, feed, subscribers) = started(2).await;
        let (a, a_cancel) = &subscribers[0];
        let (b, _) = &subscribers[1];

        feed.chunk(b"c1");
        within(a.wait_for_chunks(1)).await;
        within(b.wait_for_chunks(1)).await;

        a_cancel.cancel();
        wait_until(|| session.subscriber_count() == 1).await;
        let attempts = a.write_attempts();

        feed.chunk(b"c2");
        within(b.wait_for_chunks(2)).await;

        assert_eq!(a.write_attempts(), attempts);
        assert_eq!(a.chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_unblocks_subscribers() {
        let (session, feed, _) = started(0).await;

        let sink = Arc::new(MemorySink::new());
        let attach = {
            let session = Arc::clone(&session);
            let sink = sink.clone();
            tokio::spawn(async move { session.attach(sink, CancellationToken::new()).await })
        };
        wait_until(|| session.subscriber_count() == 1).await;

        feed.fail("connection reset");
        let result = within(attach).await.unwrap();

        match result {
            Err(Error::SessionTerminated { reason, .. }) => {
                assert!(reason.contains("connection reset"), "{reason}");
            }
            other => panic!("unexpected attach result: {other:?}"),
        }
        assert_eq!(session.phase(), SessionPhase::Terminated);
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_end_terminates() {
        let (upstream, feed) = FeedUpstream::new();
        let session = session(upstream);
        let run = tokio::spawn(Arc::clone(&session).run());

        feed.chunk(b"last");
        drop(feed);
        within(run).await.unwrap();

        assert!(session.is_terminated());
        assert_eq!(
            session.stats().termination_reason.as_deref(),
            Some("upstream watch closed")
        );
    }

    #[tokio::test]
    async fn test_attach_to_terminated_session_returns_promptly() {
        let (session, _feed, _) = started(0).await;
        session.cancel();
        within(session.terminated()).await;

        let sink = Arc::new(MemorySink::new());
        let result = within(session.attach(sink.clone(), CancellationToken::new())).await;

        assert!(matches!(result, Err(Error::SessionTerminated { .. })));
        assert_eq!(sink.status(), None);
    }

    #[tokio::test]
    async fn test_attach_blocks_until_cancelled() {
        let (session, _feed, _) = started(0).await;
        let cancel = CancellationToken::new();

        let mut attach = task::spawn(session.attach(Arc::new(MemorySink::new()), cancel.clone()));
        assert_pending!(attach.poll());
        assert_eq!(session.subscriber_count(), 1);

        cancel.cancel();
        assert!(attach.is_woken());
        let result = assert_ready!(attach.poll());
        assert!(result.is_ok());
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_leaving_subscriber_releases_stalled_write() {
        let (session, feed, subscribers) = started(1).await;
        let (healthy, _) = &subscribers[0];

        let stalled = Arc::new(StalledSink::default());
        let stalled_cancel = CancellationToken::new();
        let attach = {
            let session = Arc::clone(&session);
            let (sink, cancel) = (stalled.clone(), stalled_cancel.clone());
            tokio::spawn(async move { session.attach(sink, cancel).await })
        };
        wait_until(|| session.subscriber_count() == 2).await;

        feed.chunk(b"c1");
        wait_until(|| stalled.writes() == 1).await;

        stalled_cancel.cancel();
        assert!(within(attach).await.unwrap().is_ok());

        feed.chunk(b"c2");
        within(healthy.wait_for_chunks(2)).await;
        assert_eq!(healthy.chunks(), vec![&b"c1"[..], &b"c2"[..]]);
        assert_eq!(stalled.writes(), 1);
        assert_eq!(session.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_terminates_during_stalled_write() {
        let (session, feed, _) = started(0).await;

        let stalled = Arc::new(StalledSink::default());
        let attach = {
            let session = Arc::clone(&session);
            let sink = stalled.clone();
            tokio::spawn(async move { session.attach(sink, CancellationToken::new()).await })
        };
        wait_until(|| session.subscriber_count() == 1).await;

        feed.chunk(b"c1");
        wait_until(|| stalled.writes() == 1).await;

        session.cancel();
        within(session.terminated()).await;

        let result = within(attach).await.unwrap();
        assert!(matches!(result, Err(Error::SessionTerminated { .. })));
        assert_eq!(session.phase(), SessionPhase::Terminated);
    }
}
