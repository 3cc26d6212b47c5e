//! Fixed-capacity pool of preloaded sessions.
//!
//! Sessions that break are never reissued. The repair loop closes them and,
//! when enabled, prepares a replacement (two attempts) before retiring the
//! slot for good. Retiring the last serviceable slot exhausts the pool.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lease::{BrokenSession, PoolCounts, PoolShared, SessionEntry, SessionLease};
use crate::config::{BrokerConfig, Credentials, PreloadDirective};
use crate::events::{BrokerEvent, EventSender};
use crate::session::{PreloadError, Session, SessionFactory, SessionId, SessionSpec};
use crate::state::SessionState;

const REPLACEMENT_ATTEMPTS: u32 = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct PreloadFailure {
    pub session: SessionId,
    pub error: String,
    pub timed_out: bool,
}

/// Outcome of the initial pool fill.
#[derive(Debug, Clone, Serialize)]
pub struct PreloadReport {
    pub requested: usize,
    pub ready: usize,
    pub failures: Vec<PreloadFailure>,
}

impl PreloadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
}

/// Point-in-time view of the pool.
///
/// `available + leased + broken == capacity`; `retired` is the part of
/// `broken` that will never come back.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub serviceable: usize,
    pub available: usize,
    pub leased: usize,
    pub broken: usize,
    pub retired: usize,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("all {requested} sessions failed to preload")]
    Unavailable {
        requested: usize,
        failures: Vec<PreloadFailure>,
    },
}

/// Connection and preload settings reused for every slot and replacement.
struct PoolSettings {
    endpoint: String,
    credentials: Option<Credentials>,
    preload: Vec<PreloadDirective>,
    preload_timeout: Duration,
    replace_broken: bool,
}

impl PoolSettings {
    fn from_config(config: &BrokerConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            credentials: config.credentials.clone(),
            preload: config.preload.clone(),
            preload_timeout: config.preload_timeout,
            replace_broken: config.replace_broken,
        }
    }

    fn spec(&self, id: SessionId) -> SessionSpec {
        SessionSpec {
            id,
            endpoint: self.endpoint.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

pub struct SessionPool<F: SessionFactory> {
    available_rx: Mutex<mpsc::Receiver<SessionEntry<F::Session>>>,
    shared: Arc<PoolShared<F::Session>>,
    report: PreloadReport,
    exhausted: CancellationToken,
    closed: CancellationToken,
    repair_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl<F: SessionFactory> SessionPool<F> {
    /// Create `pool_size` sessions and preload each one concurrently.
    ///
    /// Slots that fail are excluded and reported; construction only fails
    /// when no slot comes up.
    pub(crate) async fn new(
        factory: Arc<F>,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Self, PoolError> {
        let capacity = config.pool_size;
        let settings = Arc::new(PoolSettings::from_config(config));

        let (available_tx, available_rx) = mpsc::channel(capacity);
        let (broken_tx, broken_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            capacity,
            available_tx,
            broken_tx,
            counts: StdMutex::new(PoolCounts::default()),
            states: DashMap::with_capacity(capacity),
            events,
        });

        tracing::info!(
            capacity,
            directives = settings.preload.len(),
            endpoint = %settings.endpoint,
            "Preloading session pool"
        );

        let ids: Vec<SessionId> = (0..capacity).map(|_| SessionId::new()).collect();
        for id in &ids {
            shared.set_state(*id, SessionState::Initializing);
        }

        let prepared = futures::future::join_all(
            ids.iter()
                .map(|id| prepare_session(factory.as_ref(), &settings, *id)),
        )
        .await;

        let mut failures = Vec::new();
        for (id, result) in ids.into_iter().zip(prepared) {
            match result {
                Ok(session) => {
                    shared.add_idle(SessionEntry { id, session });
                }
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "Session failed to preload - excluded from pool");
                    {
                        let mut counts = shared.counts();
                        counts.broken += 1;
                        counts.retired += 1;
                    }
                    shared.set_state(id, SessionState::Retired);
                    failures.push(PreloadFailure {
                        session: id,
                        error: e.to_string(),
                        timed_out: matches!(e, PreloadError::Timeout(_)),
                    });
                }
            }
        }

        if failures.len() == capacity {
            tracing::error!(capacity, "Every session failed to preload");
            return Err(PoolError::Unavailable {
                requested: capacity,
                failures,
            });
        }

        let report = PreloadReport {
            requested: capacity,
            ready: capacity - failures.len(),
            failures,
        };
        if report.is_complete() {
            tracing::info!(ready = report.ready, "Session pool ready");
        } else {
            tracing::warn!(
                requested = report.requested,
                ready = report.ready,
                "Session pool ready with reduced capacity"
            );
        }

        let exhausted = CancellationToken::new();
        let closed = CancellationToken::new();
        let repair_loop = tokio::spawn(run_repair_loop(
            factory,
            Arc::clone(&shared),
            settings,
            broken_rx,
            closed.clone(),
            exhausted.clone(),
        ));

        Ok(Self {
            available_rx: Mutex::new(available_rx),
            shared,
            report,
            exhausted,
            closed,
            repair_loop: StdMutex::new(Some(repair_loop)),
        })
    }

    /// Wait for an idle session. Returns `None` once the pool is exhausted
    /// or closed.
    pub async fn acquire(&self) -> Option<SessionLease<F::Session>> {
        let mut rx = tokio::select! {
            rx = self.available_rx.lock() => rx,
            _ = self.exhausted.cancelled() => return None,
            _ = self.closed.cancelled() => return None,
        };

        tokio::select! {
            entry = rx.recv() => entry.map(|entry| SessionLease::new(entry, Arc::clone(&self.shared))),
            _ = self.exhausted.cancelled() => None,
            _ = self.closed.cancelled() => None,
        }
    }

    pub fn try_acquire(&self) -> Option<SessionLease<F::Session>> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.available_rx.try_lock().ok()?;
        let entry = rx.try_recv().ok()?;
        Some(SessionLease::new(entry, Arc::clone(&self.shared)))
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Sessions that are, or may again become, available for work.
    pub fn max_concurrency(&self) -> usize {
        self.shared.capacity - self.shared.counts().retired
    }

    pub fn available(&self) -> usize {
        self.shared.counts().available
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }

    pub fn preload_report(&self) -> &PreloadReport {
        &self.report
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let counts = *self.shared.counts();
        let mut sessions: Vec<SessionSnapshot> = self
            .shared
            .states
            .iter()
            .map(|entry| SessionSnapshot {
                id: *entry.key(),
                state: *entry.value(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id.to_string());

        PoolSnapshot {
            capacity: self.shared.capacity,
            serviceable: self.shared.capacity - counts.retired,
            available: counts.available,
            leased: counts.leased,
            broken: counts.broken,
            retired: counts.retired,
            sessions,
        }
    }

    /// Stop the repair loop and close every idle session.
    ///
    /// Leases still outstanding are closed by the repair path when released.
    pub async fn close(&self) {
        let repair_loop = self
            .repair_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(repair_loop) = repair_loop else {
            return;
        };

        self.closed.cancel();
        if let Err(e) = repair_loop.await {
            tracing::error!(error = %e, "Repair loop ended abnormally");
        }

        let mut rx = self.available_rx.lock().await;
        rx.close();
        let mut closed = 0usize;
        while let Ok(mut entry) = rx.try_recv() {
            close_quietly(entry.id, &mut entry.session).await;
            {
                let mut counts = self.shared.counts();
                counts.available = counts.available.saturating_sub(1);
                counts.broken += 1;
                counts.retired += 1;
            }
            self.shared.set_state(entry.id, SessionState::Retired);
            closed += 1;
        }

        tracing::info!(closed, "Session pool closed");
    }
}

impl<F: SessionFactory> Drop for SessionPool<F> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn prepare_session<F: SessionFactory>(
    factory: &F,
    settings: &PoolSettings,
    id: SessionId,
) -> Result<F::Session, PreloadError> {
    let spec = settings.spec(id);
    let prepare = async {
        let mut session = factory.create(&spec).await?;
        if let Err(e) = factory.preload(&mut session, &settings.preload).await {
            close_quietly(id, &mut session).await;
            return Err(e);
        }
        Ok::<_, PreloadError>(session)
    };

    tokio::time::timeout(settings.preload_timeout, prepare)
        .await
        .map_err(|_| PreloadError::Timeout(settings.preload_timeout))?
}

async fn close_quietly<S: Session>(id: SessionId, session: &mut S) {
    match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => tracing::debug!(session = %id, "Session closed"),
        Ok(Err(e)) => tracing::warn!(session = %id, error = %e, "Error closing session"),
        Err(_) => tracing::warn!(session = %id, "Timed out closing session"),
    }
}

async fn run_repair_loop<F: SessionFactory>(
    factory: Arc<F>,
    shared: Arc<PoolShared<F::Session>>,
    settings: Arc<PoolSettings>,
    mut broken_rx: mpsc::UnboundedReceiver<BrokenSession<F::Session>>,
    closed: CancellationToken,
    exhausted: CancellationToken,
) {
    loop {
        let broken = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            msg = broken_rx.recv() => match msg {
                Some(broken) => broken,
                None => break,
            },
        };

        let BrokenSession { id, session } = broken;
        if let Some(mut session) = session {
            close_quietly(id, &mut session).await;
        }

        if settings.replace_broken
            && replace_session(factory.as_ref(), &shared, &settings, id, &closed).await
        {
            continue;
        }
        if closed.is_cancelled() {
            retire_slot(&shared, id, None);
            break;
        }
        retire_slot(&shared, id, Some(&exhausted));
    }

    broken_rx.close();
    while let Ok(BrokenSession { id, session }) = broken_rx.try_recv() {
        if let Some(mut session) = session {
            close_quietly(id, &mut session).await;
        }
        retire_slot(&shared, id, None);
    }

    tracing::debug!("Repair loop exiting");
}

/// Prepare a fresh session for a broken slot. Returns `true` once the
/// replacement is in the available set.
async fn replace_session<F: SessionFactory>(
    factory: &F,
    shared: &PoolShared<F::Session>,
    settings: &PoolSettings,
    old: SessionId,
    closed: &CancellationToken,
) -> bool {
    for attempt in 1..=REPLACEMENT_ATTEMPTS {
        let new = SessionId::new();
        shared.set_state(new, SessionState::Initializing);

        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                shared.states.remove(&new);
                return false;
            }
            result = prepare_session(factory, settings, new) => result,
        };

        match result {
            Ok(session) => {
                shared.states.remove(&old);
                if !shared.replace_broken(SessionEntry { id: new, session }) {
                    return false;
                }
                tracing::info!(%old, %new, attempt, "Broken session replaced");
                shared
                    .events
                    .emit(BrokerEvent::SessionReplaced { old, new });
                return true;
            }
            Err(e) => {
                shared.states.remove(&new);
                tracing::warn!(session = %old, attempt, error = %e, "Session replacement failed");
            }
        }
    }
    false
}

/// Permanently drop a slot from service. Cancels `exhausted` when it was the
/// last serviceable slot.
fn retire_slot<S: Session>(
    shared: &PoolShared<S>,
    id: SessionId,
    exhausted: Option<&CancellationToken>,
) {
    let serviceable = {
        let mut counts = shared.counts();
        counts.retired += 1;
        shared.capacity.saturating_sub(counts.retired)
    };
    shared.set_state(id, SessionState::Retired);

    let Some(exhausted) = exhausted else {
        return;
    };
    tracing::warn!(session = %id, serviceable, "Slot retired - capacity permanently reduced");
    shared.events.emit(BrokerEvent::SlotRetired { session: id });

    if serviceable == 0 {
        tracing::error!("No serviceable sessions remain");
        exhausted.cancel();
        shared.events.emit(BrokerEvent::PoolExhausted);
    }
}
