//! Error types
//!
//! Every failure the proxy can surface to a client maps onto an [`ApiStatus`].
//! Errors raised by collaborators keep their original status and message.

use thiserror::Error;

use crate::status::ApiStatus;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Request carries no routable resource metadata
    #[error("request({0}) is not supported when cluster is unhealthy")]
    Unsupported(String),

    /// Resource-identity key could not be derived
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The upstream watch request could not be constructed
    #[error("could not build watch request for {resource}: {reason}")]
    InvalidWatchRequest { resource: String, reason: String },

    /// The watch session stopped streaming
    #[error("watch session {key} terminated: {reason}")]
    SessionTerminated { key: String, reason: String },

    /// Error produced by a collaborator (upstream, local cache), passed through verbatim
    #[error("{0}")]
    Api(ApiStatus),

    /// Writing to a response sink failed
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Listener or socket failure
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Structured status for this error
    pub fn status(&self) -> ApiStatus {
        match self {
            Error::Unsupported(_) => ApiStatus::bad_request(self.to_string()),
            Error::Key(_) | Error::InvalidWatchRequest { .. } | Error::Sink(_) | Error::Io(_) => {
                ApiStatus::internal(self.to_string())
            }
            Error::SessionTerminated { .. } => ApiStatus::service_unavailable(self.to_string()),
            Error::Api(status) => status.clone(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<ApiStatus> for Error {
    fn from(status: ApiStatus) -> Self {
        Error::Api(status)
    }
}

/// Failure to compute a resource-identity key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("request info is empty")]
    MissingRequestInfo,
    #[error("component is empty")]
    EmptyComponent,
    #[error("resource is empty")]
    EmptyResource,
}

/// Failure to deliver bytes to a response sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The receiving side is gone (client disconnected, session dropped)
    #[error("response sink closed")]
    Closed,
    /// Sink-specific I/O failure
    #[error("response sink write failed: {0}")]
    Io(String),
}
