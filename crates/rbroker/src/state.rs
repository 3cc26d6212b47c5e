//! Lifecycle states for the broker and its sessions.

use serde::{Deserialize, Serialize};

/// Lifecycle of an [`RBroker`](crate::RBroker).
///
/// Transitions only move forward: `Created -> Running -> Draining -> Shutdown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerState {
    /// Pool is being created and preloaded
    #[default]
    Created,
    /// Accepting submissions
    Running,
    /// Rejecting submissions, finishing queued and in-flight work
    Draining,
    /// Pool closed, terminal
    Shutdown,
}

impl BrokerState {
    pub fn accepts_submissions(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single pool slot's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Being created or preloaded (initial fill or replacement)
    Initializing,
    /// In the available set, ready to be leased
    Idle,
    /// Leased to exactly one running task
    Busy,
    /// Unusable; awaiting replacement
    Broken,
    /// Permanently out of service
    Retired,
}

impl SessionState {
    pub fn is_serviceable(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}
