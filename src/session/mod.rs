//! Watch sessions
//!
//! A session owns one upstream watch connection for one resource key and
//! fans every chunk the upstream produces out to the subscribers attached to
//! it. Subscribers come and go without affecting the upstream connection.

pub mod adapter;
pub mod state;
pub mod watch;

pub use adapter::StreamAdapter;
pub use state::SessionPhase;
pub use watch::{resource_path, WatchSession};
