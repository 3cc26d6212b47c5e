//! Broker events fanned out to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::SessionId;
use crate::state::BrokerState;
use crate::task::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    StateChanged {
        from: BrokerState,
        to: BrokerState,
    },
    TaskCompleted {
        id: TaskId,
        status: TaskStatus,
    },
    SessionBroken {
        session: SessionId,
        reason: String,
    },
    SessionReplaced {
        old: SessionId,
        new: SessionId,
    },
    SlotRetired {
        session: SessionId,
    },
    /// No serviceable session remains; the broker rejects further work.
    PoolExhausted,
}

/// Sending half shared by the pool, dispatcher and supervisor.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// No subscribers is not an error.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}
