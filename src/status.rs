//! API-style status objects
//!
//! Failed requests are answered with a Kubernetes `Status` object so that
//! clients talking to the proxy see the same error shape they would get from
//! the API server itself.

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

/// Machine-readable failure reason, mirroring the API server's `StatusReason`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusReason {
    BadRequest,
    NotFound,
    RequestEntityTooLarge,
    ServiceUnavailable,
    InternalError,
    Unknown,
}

impl StatusReason {
    /// Best-fit reason for an HTTP status code
    pub fn from_code(code: StatusCode) -> Self {
        match code {
            StatusCode::BAD_REQUEST => StatusReason::BadRequest,
            StatusCode::NOT_FOUND => StatusReason::NotFound,
            StatusCode::PAYLOAD_TOO_LARGE => StatusReason::RequestEntityTooLarge,
            StatusCode::SERVICE_UNAVAILABLE => StatusReason::ServiceUnavailable,
            StatusCode::INTERNAL_SERVER_ERROR => StatusReason::InternalError,
            _ => StatusReason::Unknown,
        }
    }
}

/// Structured error carried back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiStatus {
    /// HTTP status code
    pub code: StatusCode,
    /// Failure reason
    pub reason: StatusReason,
    /// Human-readable message
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusObject<'a> {
    kind: &'static str,
    api_version: &'static str,
    metadata: Metadata,
    status: &'static str,
    message: &'a str,
    reason: StatusReason,
    code: u16,
}

#[derive(Serialize)]
struct Metadata {}

#[derive(Serialize)]
struct WatchEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    object: StatusObject<'a>,
}

impl ApiStatus {
    /// Create a status with an explicit code; the reason is derived from it
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: StatusReason::from_code(code),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    fn object(&self) -> StatusObject<'_> {
        StatusObject {
            kind: "Status",
            api_version: "v1",
            metadata: Metadata {},
            status: "Failure",
            message: &self.message,
            reason: self.reason,
            code: self.code.as_u16(),
        }
    }

    /// Serialize as a standalone `Status` response body
    pub fn to_body(&self) -> Bytes {
        encode(&self.object())
    }

    /// Serialize as a watch `ERROR` event, for streams that already sent a 200
    pub fn to_watch_event(&self) -> Bytes {
        let mut line = encode(&WatchEvent {
            event_type: "ERROR",
            object: self.object(),
        })
        .to_vec();
        line.push(b'\n');
        Bytes::from(line)
    }
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    // Serializing plain strings and integers cannot fail
    serde_json::to_vec(value)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(b"{\"kind\":\"Status\",\"status\":\"Failure\"}"))
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_body_shape() {
        let status = ApiStatus::bad_request("nope");
        let value: serde_json::Value = serde_json::from_slice(&status.to_body()).unwrap();

        assert_eq!(value["kind"], "Status");
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["status"], "Failure");
        assert_eq!(value["reason"], "BadRequest");
        assert_eq!(value["message"], "nope");
        assert_eq!(value["code"], 400);
    }

    #[test]
    fn test_watch_event_is_newline_terminated() {
        let status = ApiStatus::service_unavailable("session gone");
        let event = status.to_watch_event();

        assert_eq!(event.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&event[..event.len() - 1]).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["object"]["code"], 503);
        assert_eq!(value["object"]["reason"], "ServiceUnavailable");
    }

    #[test]
    fn test_reason_from_code() {
        assert_eq!(
            StatusReason::from_code(StatusCode::PAYLOAD_TOO_LARGE),
            StatusReason::RequestEntityTooLarge
        );
        assert_eq!(
            StatusReason::from_code(StatusCode::IM_A_TEAPOT),
            StatusReason::Unknown
        );
    }
}
