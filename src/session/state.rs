//! Session state machine
//!
//! Tracks a watch session from construction to the end of its upstream stream.

use std::time::{Duration, Instant};

/// Watch session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, upstream request not yet issued
    Initializing,
    /// Upstream round trip running, broadcast loop delivering chunks
    Streaming,
    /// Upstream ended, failed, or the session was cancelled
    Terminated,
}

/// Phase plus the bookkeeping that goes with it
#[derive(Debug)]
pub(crate) struct SessionState {
    pub phase: SessionPhase,
    /// Why the session terminated
    pub reason: Option<String>,
    pub started_at: Option<Instant>,
    pub terminated_at: Option<Instant>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Initializing,
            reason: None,
            started_at: None,
            terminated_at: None,
        }
    }

    /// Move to `Streaming`. Returns false unless the session was initializing.
    pub fn start(&mut self) -> bool {
        if self.phase != SessionPhase::Initializing {
            return false;
        }
        self.phase = SessionPhase::Streaming;
        self.started_at = Some(Instant::now());
        true
    }

    /// Move to `Terminated`. The first reason recorded wins.
    pub fn terminate(&mut self, reason: String) {
        if self.phase == SessionPhase::Terminated {
            return;
        }
        self.phase = SessionPhase::Terminated;
        self.reason = Some(reason);
        self.terminated_at = Some(Instant::now());
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == SessionPhase::Terminated
    }

    /// Time spent streaming; `None` if the session never started
    pub fn streaming_for(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.terminated_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }
}
