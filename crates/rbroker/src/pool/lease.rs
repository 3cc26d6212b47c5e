//! Session leases with typestate release.
//!
//! A lease is created `Busy` by the pool and must be released exactly once:
//! - `SessionLease` -> `IdleLease` via `into_idle()` (returns to the pool on drop)
//! - `SessionLease` -> `BrokenLease` via `into_broken()` (handed to the repair loop on drop)
//! - `BrokenLease` -> `IdleLease`: NOT POSSIBLE (no method exists)

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::events::{BrokerEvent, EventSender};
use crate::session::{Session, SessionId};
use crate::state::SessionState;

pub(crate) struct SessionEntry<S> {
    pub id: SessionId,
    pub session: S,
}

/// A session that left service, on its way to the repair loop.
pub(crate) struct BrokenSession<S> {
    pub id: SessionId,
    /// `None` when the lease no longer held its session.
    pub session: Option<S>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolCounts {
    pub available: usize,
    pub leased: usize,
    /// Out of service: awaiting replacement or retired.
    pub broken: usize,
    /// Permanently out of service (subset of `broken`).
    pub retired: usize,
}

/// State shared between the pool, its repair loop and every outstanding lease.
pub(crate) struct PoolShared<S> {
    pub capacity: usize,
    pub available_tx: mpsc::Sender<SessionEntry<S>>,
    pub broken_tx: mpsc::UnboundedSender<BrokenSession<S>>,
    pub counts: StdMutex<PoolCounts>,
    pub states: DashMap<SessionId, SessionState>,
    pub events: EventSender,
}

impl<S: Session> PoolShared<S> {
    /// Counts are plain integers, so a poisoned lock is still usable.
    pub fn counts(&self) -> MutexGuard<'_, PoolCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) {
        self.states.insert(id, state);
    }

    /// Put a freshly prepared session into the available set.
    pub fn add_idle(&self, entry: SessionEntry<S>) -> bool {
        self.push_idle(entry, |_| {})
    }

    /// Put a replacement into the available set, moving its slot out of
    /// `broken` under the same guard.
    pub fn replace_broken(&self, entry: SessionEntry<S>) -> bool {
        self.push_idle(entry, |counts| {
            counts.broken = counts.broken.saturating_sub(1);
        })
    }

    fn push_idle(&self, entry: SessionEntry<S>, adjust: impl FnOnce(&mut PoolCounts)) -> bool {
        let id = entry.id;
        let mut counts = self.counts();
        match self.available_tx.try_send(entry) {
            Ok(()) => {
                adjust(&mut counts);
                counts.available += 1;
                drop(counts);
                self.set_state(id, SessionState::Idle);
                true
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "Failed to add session to pool");
                false
            }
        }
    }

    /// Move a leased session back to the available set.
    fn return_idle(&self, entry: SessionEntry<S>) {
        let id = entry.id;
        let mut counts = self.counts();
        match self.available_tx.try_send(entry) {
            Ok(()) => {
                counts.leased = counts.leased.saturating_sub(1);
                counts.available += 1;
                drop(counts);
                self.set_state(id, SessionState::Idle);
            }
            Err(e) => {
                drop(counts);
                // Pool is closed; let the repair path close it out.
                let entry = match e {
                    mpsc::error::TrySendError::Full(entry) => entry,
                    mpsc::error::TrySendError::Closed(entry) => entry,
                };
                tracing::debug!(session = %id, "Pool closed - session not returned");
                self.report_broken(
                    BrokenSession {
                        id,
                        session: Some(entry.session),
                    },
                    "pool closed",
                );
            }
        }
    }

    /// Move a leased session out of service.
    fn report_broken(&self, broken: BrokenSession<S>, reason: &str) {
        let id = broken.id;
        {
            let mut counts = self.counts();
            counts.leased = counts.leased.saturating_sub(1);
            counts.broken += 1;
        }
        self.set_state(id, SessionState::Broken);
        tracing::warn!(session = %id, %reason, "Session broken - removed from service");
        self.events.emit(BrokerEvent::SessionBroken {
            session: id,
            reason: reason.to_string(),
        });

        if self.broken_tx.send(broken).is_err() {
            tracing::debug!(session = %id, "Repair loop stopped - dropping broken session");
        }
    }
}

/// What the dispatcher observed about a session after a task ran on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    Broken(String),
}

/// A session leased to exactly one task.
pub struct SessionLease<S: Session> {
    id: SessionId,
    session: Option<S>,
    shared: Arc<PoolShared<S>>,
    released: bool,
}

impl<S: Session> SessionLease<S> {
    pub(crate) fn new(entry: SessionEntry<S>, shared: Arc<PoolShared<S>>) -> Self {
        {
            let mut counts = shared.counts();
            counts.available = counts.available.saturating_sub(1);
            counts.leased += 1;
        }
        shared.set_state(entry.id, SessionState::Busy);

        Self {
            id: entry.id,
            session: Some(entry.session),
            shared,
            released: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session_mut(&mut self) -> Option<&mut S> {
        self.session.as_mut()
    }

    /// Move the session out for the duration of a call; `restore` puts it back.
    pub(crate) fn take_session(&mut self) -> Option<S> {
        self.session.take()
    }

    pub(crate) fn restore(&mut self, session: S) {
        self.session = Some(session);
    }

    /// Transition to idle - the session returns to the pool on drop.
    pub fn into_idle(mut self) -> IdleLease<S> {
        self.released = true;
        IdleLease {
            id: self.id,
            session: self.session.take(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Transition to broken - the session never returns to the available set.
    pub fn into_broken(mut self, reason: impl Into<String>) -> BrokenLease<S> {
        self.released = true;
        BrokenLease {
            id: self.id,
            session: self.session.take(),
            reason: reason.into(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self, outcome: ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Healthy => drop(self.into_idle()),
            ReleaseOutcome::Broken(reason) => drop(self.into_broken(reason)),
        }
    }
}

impl<S: Session> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(session = %self.id, "SessionLease dropped without release");
            self.shared.report_broken(
                BrokenSession {
                    id: self.id,
                    session: self.session.take(),
                },
                "lease dropped without release",
            );
        }
    }
}

/// A released, healthy session - returns to the pool on drop.
pub struct IdleLease<S: Session> {
    id: SessionId,
    session: Option<S>,
    shared: Arc<PoolShared<S>>,
}

impl<S: Session> IdleLease<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl<S: Session> Drop for IdleLease<S> {
    fn drop(&mut self) {
        match self.session.take() {
            Some(session) => self.shared.return_idle(SessionEntry {
                id: self.id,
                session,
            }),
            None => {
                tracing::error!(session = %self.id, "Idle lease has no session - treating as broken");
                self.shared.report_broken(
                    BrokenSession {
                        id: self.id,
                        session: None,
                    },
                    "session lost before release",
                );
            }
        }
    }
}

/// A broken session - reported to the repair loop on drop.
pub struct BrokenLease<S: Session> {
    id: SessionId,
    session: Option<S>,
    reason: String,
    shared: Arc<PoolShared<S>>,
}

impl<S: Session> Drop for BrokenLease<S> {
    fn drop(&mut self) {
        self.shared.report_broken(
            BrokenSession {
                id: self.id,
                session: self.session.take(),
            },
            &self.reason,
        );
    }
}
