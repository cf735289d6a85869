//! Response sinks
//!
//! A [`ResponseSink`] is where a handler writes its response: a status, some
//! headers, and a sequence of body chunks. The dispatcher, the upstream
//! transport and the watch sessions all talk to sinks rather than to a
//! concrete connection, which lets one upstream stream be captured once and
//! replayed into many client responses.
//!
//! ```text
//!   HttpUpstream ──write()──► StreamAdapter ──chunk──► broadcast loop
//!                                                          │
//!                                 ┌────────────────────────┼──────────────┐
//!                                 ▼                        ▼              ▼
//!                              BodySink                 BodySink      MemorySink
//! ```

pub mod body;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;

use crate::error::SinkError;
use crate::status::ApiStatus;

pub use body::{BodySink, ResponseHead, SinkBody};
pub use memory::MemorySink;

/// Destination for one HTTP response
///
/// Sinks are shared (`Arc<dyn ResponseSink>`) between the task that owns the
/// request and a broadcast loop, so every method takes `&self`.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Set a response header. Ignored once the status has been committed.
    fn insert_header(&self, name: HeaderName, value: HeaderValue);

    /// Commit the response status. Only the first call has an effect.
    fn write_header(&self, status: StatusCode);

    /// The committed status, if any
    fn status(&self) -> Option<StatusCode>;

    /// Write one body chunk, committing `200 OK` first if nothing was committed yet
    async fn write(&self, chunk: Bytes) -> Result<usize, SinkError>;
}

/// Write a structured error to a sink
///
/// A sink that has not started its response gets a full `Status` body with
/// the error's code. A sink that is already streaming (a watch that was cut
/// short) gets a watch `ERROR` event appended instead.
pub async fn write_error(sink: &dyn ResponseSink, status: &ApiStatus) -> Result<(), SinkError> {
    if sink.status().is_some() {
        sink.write(status.to_watch_event()).await?;
        return Ok(());
    }

    sink.insert_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    sink.write_header(status.code);
    sink.write(status.to_body()).await?;
    Ok(())
}
