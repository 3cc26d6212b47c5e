//! Shared in-memory engine for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rbroker::{
    PreloadDirective, PreloadError, Session, SessionError, SessionFactory, SessionId, SessionSpec,
    Worker, WorkerError,
};

/// Observations shared by every session and worker of one test.
#[derive(Default)]
pub struct EngineStats {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub in_use: Mutex<HashSet<SessionId>>,
    pub order: Mutex<Vec<usize>>,
}

impl EngineStats {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> Vec<usize> {
        self.order.lock().unwrap().clone()
    }
}

pub struct EngineSession {
    pub id: SessionId,
    pub workspace: Vec<String>,
    stats: Arc<EngineStats>,
}

#[async_trait]
impl Session for EngineSession {
    async fn close(&mut self) -> Result<(), SessionError> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct EngineFactory {
    pub stats: Arc<EngineStats>,
    failing_preloads: AtomicUsize,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(EngineStats::default()),
            failing_preloads: AtomicUsize::new(0),
        }
    }

    pub fn failing_preloads(self, n: usize) -> Self {
        self.failing_preloads.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl SessionFactory for EngineFactory {
    type Session = EngineSession;

    async fn create(&self, spec: &SessionSpec) -> Result<EngineSession, PreloadError> {
        self.stats.creates.fetch_add(1, Ordering::SeqCst);
        Ok(EngineSession {
            id: spec.id,
            workspace: Vec::new(),
            stats: Arc::clone(&self.stats),
        })
    }

    async fn preload(
        &self,
        session: &mut EngineSession,
        directives: &[PreloadDirective],
    ) -> Result<(), PreloadError> {
        let fail = self
            .failing_preloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            let directive = directives
                .first()
                .cloned()
                .unwrap_or_else(|| PreloadDirective::new("model.rData", "scoring", "admin"));
            return Err(PreloadError::preload(&directive, "file not found"));
        }
        session
            .workspace
            .extend(directives.iter().map(PreloadDirective::resource));
        Ok(())
    }
}

/// Scores one input against the session, holding it for `delay`.
///
/// Records concurrency and exclusivity on the shared stats.
pub struct ScoreWorker {
    pub n: usize,
    pub delay: Duration,
    pub stats: Arc<EngineStats>,
}

impl ScoreWorker {
    pub fn new(n: usize, delay: Duration, stats: &Arc<EngineStats>) -> Self {
        Self {
            n,
            delay,
            stats: Arc::clone(stats),
        }
    }
}

#[async_trait]
impl Worker<EngineSession> for ScoreWorker {
    async fn call(&mut self, session: &mut EngineSession) -> Result<serde_json::Value, WorkerError> {
        if !self.stats.in_use.lock().unwrap().insert(session.id) {
            return Err(WorkerError::failed("session already in use"));
        }
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);
        self.stats.order.lock().unwrap().push(self.n);

        tokio::time::sleep(self.delay).await;

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.in_use.lock().unwrap().remove(&session.id);
        Ok(serde_json::json!({ "input": self.n, "score": self.n as f64 * 0.5 }))
    }
}

/// Runs until its gate fires.
pub struct GateWorker {
    gate: Option<tokio::sync::oneshot::Receiver<()>>,
}

impl GateWorker {
    pub fn new() -> (tokio::sync::oneshot::Sender<()>, Self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (tx, Self { gate: Some(rx) })
    }
}

#[async_trait]
impl Worker<EngineSession> for GateWorker {
    async fn call(&mut self, _session: &mut EngineSession) -> Result<serde_json::Value, WorkerError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        Ok(serde_json::Value::Null)
    }
}

pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
