//! Server lifecycle status
//!
//! A forward-only state machine: Starting → Ready → OnShutdown → Closed.
//! Readers get a copy; nothing hands out a reference into the lock.

use std::fmt;
use std::sync::Mutex;

/// Lifecycle state of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ServerStatus {
    #[default]
    Starting,
    Ready,
    OnShutdown,
    Closed,
}

impl ServerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ServerStatus::Ready)
    }

    pub fn text(&self) -> &'static str {
        match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Ready => "ready",
            ServerStatus::OnShutdown => "shutting down",
            ServerStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Mutex-guarded status with forward-only transitions
#[derive(Debug, Default)]
pub struct StatusCell {
    status: Mutex<ServerStatus>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current status
    pub fn get(&self) -> ServerStatus {
        match self.status.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns false (and changes nothing) for same-state or backward moves.
    pub fn advance(&self, next: ServerStatus) -> bool {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if next <= *guard {
            return false;
        }
        tracing::debug!(from = %*guard, to = %next, "status change");
        *guard = next;
        true
    }
}
