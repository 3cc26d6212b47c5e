//! In-memory sessions for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::PreloadDirective;
use crate::session::{PreloadError, Session, SessionError, SessionFactory, SessionSpec};
use crate::worker::{Worker, WorkerError};

pub struct MemorySession {
    pub preloaded: Vec<String>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for MemorySession {
    async fn close(&mut self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFactory {
    fail_preloads: Arc<AtomicUsize>,
    preloads: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    preload_delay: Option<Duration>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` preloads fail.
    pub fn failing_preloads(self, n: usize) -> Self {
        self.fail_preloads.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_preload_delay(mut self, delay: Duration) -> Self {
        self.preload_delay = Some(delay);
        self
    }

    /// Counter of preloads still to fail; can be raised after construction.
    pub fn fail_next_preloads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fail_preloads)
    }

    pub fn preload_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.preloads)
    }

    pub fn close_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    type Session = MemorySession;

    async fn create(&self, _spec: &SessionSpec) -> Result<MemorySession, PreloadError> {
        Ok(MemorySession {
            preloaded: Vec::new(),
            closes: Arc::clone(&self.closes),
        })
    }

    async fn preload(
        &self,
        session: &mut MemorySession,
        directives: &[PreloadDirective],
    ) -> Result<(), PreloadError> {
        self.preloads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.preload_delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .fail_preloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PreloadError::create("engine refused workspace"));
        }
        session
            .preloaded
            .extend(directives.iter().map(PreloadDirective::resource));
        Ok(())
    }
}

/// Completes once its gate fires (or the gate sender is dropped).
pub struct GatedWorker {
    gate: Option<oneshot::Receiver<()>>,
}

impl GatedWorker {
    pub fn new(gate: oneshot::Receiver<()>) -> Self {
        Self { gate: Some(gate) }
    }
}

#[async_trait]
impl Worker<MemorySession> for GatedWorker {
    async fn call(&mut self, _session: &mut MemorySession) -> Result<serde_json::Value, WorkerError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        Ok(serde_json::Value::Null)
    }
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 1s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
