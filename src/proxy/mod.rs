//! Request routing

pub mod dispatcher;
pub mod handler;

pub use dispatcher::SiteProxy;
pub use handler::Handler;
