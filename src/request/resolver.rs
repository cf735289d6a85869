//! Request-info resolution from method and URI
//!
//! Follows the API server's path layout:
//!
//! ```text
//! /api/{version}/{resource}[/{name}[/{subresource}]]
//! /api/{version}/namespaces/{namespace}/{resource}[/{name}[/{subresource}]]
//! /apis/{group}/{version}/...                        (same tail)
//! /api/{version}/watch/...                           (legacy watch prefix)
//! ```
//!
//! Anything else (`/healthz`, `/version`, `/openapi/v2`, ...) is a
//! non-resource request.

use http::{Method, Uri};

use super::info::{RequestInfo, Verb};

/// First path segment of every API resource request
const API_PREFIXES: &[&str] = &["api", "apis"];

/// Prefixes followed by an API group segment
const GROUPED_PREFIXES: &[&str] = &["apis"];

/// Resolves [`RequestInfo`] for incoming requests
#[derive(Debug, Clone, Default)]
pub struct RequestInfoResolver;

impl RequestInfoResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve metadata for a request
    pub fn resolve(&self, method: &Method, uri: &Uri) -> RequestInfo {
        let path = uri.path();
        let fallback_verb = Verb::from(method.as_str().to_ascii_lowercase().as_str());
        let non_resource = || RequestInfo::non_resource(path, fallback_verb.clone());

        let mut parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() < 3 || !API_PREFIXES.contains(&parts[0]) {
            return non_resource();
        }

        let api_prefix = parts.remove(0);
        let mut api_group = "";
        if GROUPED_PREFIXES.contains(&api_prefix) {
            api_group = parts.remove(0);
        }
        if parts.is_empty() {
            return non_resource();
        }
        let api_version = parts.remove(0);
        if parts.is_empty() || parts[0].is_empty() {
            return non_resource();
        }

        let mut verb = match *method {
            Method::POST => Verb::Create,
            Method::GET | Method::HEAD => Verb::Get,
            Method::PUT => Verb::Update,
            Method::PATCH => Verb::Patch,
            Method::DELETE => Verb::Delete,
            _ => fallback_verb.clone(),
        };

        if parts[0] == "watch" {
            parts.remove(0);
            verb = Verb::Watch;
            if parts.is_empty() {
                return non_resource();
            }
        }

        let mut info = RequestInfo::resource(verb, api_group, api_version, "");
        info.api_prefix = api_prefix.to_string();
        info.path = path.to_string();

        if parts[0] == "namespaces" {
            if parts.len() > 1 {
                info.namespace = parts[1].to_string();
                // "namespaces/{ns}" alone addresses the namespace object itself
                if parts.len() > 2 {
                    parts.drain(..2);
                }
            }
        }

        match parts.len() {
            0 => return non_resource(),
            1 => info.resource = parts[0].to_string(),
            2 => {
                info.resource = parts[0].to_string();
                info.name = parts[1].to_string();
            }
            _ => {
                info.resource = parts[0].to_string();
                info.name = parts[1].to_string();
                info.subresource = parts[2].to_string();
            }
        }

        // Collections: get without a name is a list, watch-flagged lists are watches
        if info.name.is_empty() && info.verb == Verb::Get {
            info.verb = Verb::List;
        }
        if matches!(info.verb, Verb::List | Verb::Get) && watch_requested(uri) {
            info.verb = Verb::Watch;
        }
        if info.name.is_empty() && info.verb == Verb::Delete {
            info.verb = Verb::DeleteCollection;
        }

        info
    }
}

fn watch_requested(uri: &Uri) -> bool {
    uri.query()
        .map(|query| {
            query.split('&').any(|pair| {
                let mut kv = pair.splitn(2, '=');
                kv.next() == Some("watch") && matches!(kv.next(), Some("true") | Some("1"))
            })
        })
        .unwrap_or(false)
}
