//! Session and routing statistics

pub mod metrics;

pub use metrics::{DispatchSnapshot, DispatchStats, SessionCounters, SessionStats};
