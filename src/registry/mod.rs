//! Session registry for watch multiplexing
//!
//! The registry maps resource keys to watch sessions. Many client watches of
//! the same resource share one session, and therefore one upstream stream.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌───────────────────────────┐
//!                   │ sessions: RwLock<HashMap< │
//!                   │   ResourceKey,            │
//!                   │   Arc<WatchSession>,      │
//!                   │ >>                        │
//!                   └─────────────┬─────────────┘
//!                                 │ attach_or_create()
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!   [watch client]          [watch client]           [list client]
//!   attach(sink)            attach(sink)             prime only
//! ```
//!
//! A session leaves the registry once its upstream stream has ended and its
//! last subscriber has detached.

pub mod config;
pub mod key;
pub mod store;

pub use config::RegistryConfig;
pub use key::{KeyBuildInfo, KeyFunc, ResourceKey, StorageKeyFunc};
pub use store::SessionRegistry;
