//! Resolved request metadata
//!
//! Requests reach the dispatcher already annotated: the outer layer stores a
//! [`RequestInfo`], an optional [`ClientComponent`], and a
//! [`CancellationToken`] in the request's extensions.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Request type handled by the proxy; bodies are buffered before dispatch
pub type ProxyRequest = http::Request<Bytes>;

/// Component name used when the request does not identify its client
pub const DEFAULT_COMPONENT: &str = "default";

/// Semantic verb of a resource request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
    DeleteCollection,
    Other(String),
}

impl Verb {
    pub fn as_str(&self) -> &str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::DeleteCollection => "deletecollection",
            Verb::Other(verb) => verb,
        }
    }

    /// Verbs that change server state and are always passed through
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Verb::Create | Verb::Update | Verb::Patch | Verb::Delete | Verb::DeleteCollection
        )
    }
}

impl From<&str> for Verb {
    fn from(verb: &str) -> Self {
        match verb {
            "get" => Verb::Get,
            "list" => Verb::List,
            "watch" => Verb::Watch,
            "create" => Verb::Create,
            "update" => Verb::Update,
            "patch" => Verb::Patch,
            "delete" => Verb::Delete,
            "deletecollection" => Verb::DeleteCollection,
            other => Verb::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata resolved from the request path and method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Whether the request targets an API resource
    pub is_resource_request: bool,
    /// Original request path
    pub path: String,
    pub verb: Verb,
    /// `api` or `apis`
    pub api_prefix: String,
    /// Empty for the core group
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
}

impl RequestInfo {
    /// Metadata for a request that is not an API resource request
    pub fn non_resource(path: impl Into<String>, verb: Verb) -> Self {
        Self {
            is_resource_request: false,
            path: path.into(),
            verb,
            api_prefix: String::new(),
            api_group: String::new(),
            api_version: String::new(),
            namespace: String::new(),
            resource: String::new(),
            subresource: String::new(),
            name: String::new(),
        }
    }

    /// Metadata for a resource request in the given group/version
    pub fn resource(
        verb: Verb,
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        let api_group = group.into();
        let api_prefix = if api_group.is_empty() { "api" } else { "apis" };
        Self {
            is_resource_request: true,
            path: String::new(),
            verb,
            api_prefix: api_prefix.to_string(),
            api_group,
            api_version: version.into(),
            namespace: String::new(),
            resource: resource.into(),
            subresource: String::new(),
            name: String::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = subresource.into();
        self
    }
}

/// Name of the local client component that issued the request (e.g. `kubelet`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientComponent(pub String);

/// Resource metadata attached to a request, if it is a resource request
pub fn request_info(req: &ProxyRequest) -> Option<&RequestInfo> {
    req.extensions()
        .get::<RequestInfo>()
        .filter(|info| info.is_resource_request)
}

/// Client component of a request, if it names a non-empty one
pub fn client_component(req: &ProxyRequest) -> Option<&str> {
    req.extensions()
        .get::<ClientComponent>()
        .map(|c| c.0.as_str())
        .filter(|c| !c.is_empty())
}

/// Cancellation token of a request; a request without one is never cancelled
pub fn cancellation(req: &ProxyRequest) -> CancellationToken {
    req.extensions()
        .get::<CancellationToken>()
        .cloned()
        .unwrap_or_default()
}

/// Short description of a request for log lines and error messages
pub fn req_string(req: &ProxyRequest) -> String {
    let component = req
        .extensions()
        .get::<ClientComponent>()
        .map(|c| c.0.as_str())
        .unwrap_or("");
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if component.is_empty() {
        format!("{} {}", req.method(), path)
    } else {
        format!("{} {} {}", component, req.method(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip_and_mutating() {
        for verb in ["create", "update", "patch", "delete", "deletecollection"] {
            assert!(Verb::from(verb).is_mutating(), "{verb}");
            assert_eq!(Verb::from(verb).as_str(), verb);
        }
        for verb in ["get", "list", "watch", "proxy"] {
            assert!(!Verb::from(verb).is_mutating(), "{verb}");
        }
        assert_eq!(Verb::from("proxy"), Verb::Other("proxy".into()));
    }

    #[test]
    fn test_request_info_requires_resource_flag() {
        let mut req = ProxyRequest::new(Bytes::new());
        assert!(request_info(&req).is_none());

        req.extensions_mut()
            .insert(RequestInfo::non_resource("/healthz", Verb::Get));
        assert!(request_info(&req).is_none());

        req.extensions_mut()
            .insert(RequestInfo::resource(Verb::List, "", "v1", "pods"));
        assert_eq!(request_info(&req).unwrap().resource, "pods");
    }

    #[test]
    fn test_empty_component_is_absent() {
        let mut req = ProxyRequest::new(Bytes::new());
        assert_eq!(client_component(&req), None);

        req.extensions_mut().insert(ClientComponent(String::new()));
        assert_eq!(client_component(&req), None);

        req.extensions_mut()
            .insert(ClientComponent("kubelet".to_string()));
        assert_eq!(client_component(&req), Some("kubelet"));
    }

    #[test]
    fn test_req_string() {
        let mut req = http::Request::builder()
            .method("GET")
            .uri("/api/v1/pods?watch=true")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(req_string(&req), "GET /api/v1/pods?watch=true");

        req.extensions_mut()
            .insert(ClientComponent("kube-proxy".to_string()));
        assert_eq!(req_string(&req), "kube-proxy GET /api/v1/pods?watch=true");
    }
}
