//! Request metadata
//!
//! - [`RequestInfo`] and [`Verb`]: what a request addresses and what it does
//! - [`RequestInfoResolver`]: derives the metadata from method and URI
//! - extension accessors used by the dispatcher and registry

pub mod info;
pub mod resolver;

pub use info::{
    cancellation, client_component, req_string, request_info, ClientComponent, ProxyRequest,
    RequestInfo, Verb, DEFAULT_COMPONENT,
};
pub use resolver::RequestInfoResolver;
