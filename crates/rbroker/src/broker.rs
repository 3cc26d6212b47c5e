//! RBroker: the public facade over the session pool and dispatcher.
//!
//! The broker owns:
//! - The session pool (preloaded once at construction)
//! - The dispatcher (admission, queue, dispatch loop)
//! - The task supervisor (outstanding count for shutdown coordination)

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::{BrokerConfig, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::events::{BrokerEvent, EventSender};
use crate::pool::{PoolError, PoolSnapshot, PreloadFailure, PreloadReport, SessionPool};
use crate::session::SessionFactory;
use crate::simulation::AppSimulator;
use crate::state::BrokerState;
use crate::supervisor::{CancelQueued, ResultSink, TaskHandle, TaskSupervisor};
use crate::task::{TaskId, TaskResult};
use crate::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("all {requested} sessions failed to preload")]
    PoolUnavailable {
        requested: usize,
        failures: Vec<PreloadFailure>,
    },
    #[error("every session preload timed out after {0:?}")]
    PreloadTimeout(Duration),
}

/// Submission refused at admission. Nothing was queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("broker is not accepting tasks (state: {state})")]
    NotRunning { state: BrokerState },
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("no serviceable sessions remain")]
    PoolExhausted,
}

/// Snapshot of broker activity.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub state: BrokerState,
    pub max_concurrency: usize,
    pub queued: usize,
    pub executing: usize,
    pub outstanding: usize,
    pub completed: u64,
    pub failed: u64,
    /// Every session slot has retired; further submissions are refused.
    pub exhausted: bool,
}

impl BrokerStatus {
    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }
}

pub struct RBroker<F: SessionFactory> {
    config: BrokerConfig,
    pool: Arc<SessionPool<F>>,
    dispatcher: Arc<Dispatcher<F>>,
    supervisor: Arc<TaskSupervisor>,
    events: EventSender,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<F: SessionFactory> RBroker<F> {
    /// Validate `config`, preload the pool and start dispatching.
    ///
    /// Must be called from within a tokio runtime; that runtime runs every
    /// task the broker dispatches.
    pub async fn new(config: BrokerConfig, factory: F) -> Result<Arc<Self>, BrokerError> {
        config.validate()?;

        let events = EventSender::new(config.event_capacity);
        let pool = match SessionPool::new(Arc::new(factory), &config, events.clone()).await {
            Ok(pool) => Arc::new(pool),
            Err(PoolError::Unavailable {
                requested,
                failures,
            }) => {
                if failures.iter().all(|f| f.timed_out) {
                    return Err(BrokerError::PreloadTimeout(config.preload_timeout));
                }
                return Err(BrokerError::PoolUnavailable {
                    requested,
                    failures,
                });
            }
        };

        let supervisor = Arc::new(TaskSupervisor::new(events.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&supervisor),
            config.queue_capacity,
            config.task_timeout,
            events.clone(),
            Handle::current(),
        ));
        dispatcher.start();
        let dispatch_loop = tokio::spawn(Arc::clone(&dispatcher).run());

        tracing::info!(
            max_concurrency = pool.max_concurrency(),
            queue_capacity = ?config.queue_capacity,
            task_timeout = ?config.task_timeout,
            "Broker running"
        );

        Ok(Arc::new(Self {
            config,
            pool,
            dispatcher,
            supervisor,
            events,
            dispatch_loop: Mutex::new(Some(dispatch_loop)),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> BrokerState {
        self.dispatcher.state()
    }

    /// Upper bound on tasks executing at once. Shrinks when slots retire.
    pub fn max_concurrency(&self) -> usize {
        self.pool.max_concurrency()
    }

    /// Submit a task and get a pollable handle to its result.
    pub fn submit<W>(&self, worker: W) -> Result<TaskHandle, AdmissionError>
    where
        W: Worker<F::Session>,
    {
        let (tx, rx) = oneshot::channel();
        let record = self
            .dispatcher
            .admit(Box::new(worker), ResultSink::Channel(tx))?;
        let canceller: Arc<dyn CancelQueued> = self.dispatcher.clone();
        Ok(TaskHandle::new(record, rx, canceller))
    }

    /// Submit a task whose result is handed to `callback` on the runtime.
    pub fn submit_with_callback<W, C>(&self, worker: W, callback: C) -> Result<TaskId, AdmissionError>
    where
        W: Worker<F::Session>,
        C: FnOnce(TaskResult) + Send + 'static,
    {
        let record = self
            .dispatcher
            .admit(Box::new(worker), ResultSink::Callback(Box::new(callback)))?;
        Ok(record.id)
    }

    /// Submit a task and wait for its result.
    pub async fn execute<W>(&self, worker: W) -> Result<TaskResult, AdmissionError>
    where
        W: Worker<F::Session>,
    {
        Ok(self.submit(worker)?.wait().await)
    }

    /// Like [`execute`](Self::execute), for callers on plain OS threads.
    ///
    /// Panics if called from within an async context.
    pub fn blocking_execute<W>(&self, worker: W) -> Result<TaskResult, AdmissionError>
    where
        W: Worker<F::Session>,
    {
        Ok(self.submit(worker)?.blocking_wait())
    }

    /// Cancel a task that has not been dispatched yet.
    pub fn cancel(&self, id: &TaskId) -> bool {
        self.dispatcher.cancel_queued(id)
    }

    /// Cancel every queued task. Returns how many were cancelled.
    pub fn flush(&self) -> usize {
        self.dispatcher.flush()
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            state: self.dispatcher.state(),
            max_concurrency: self.pool.max_concurrency(),
            queued: self.dispatcher.queued(),
            executing: self.supervisor.executing(),
            outstanding: self.supervisor.outstanding(),
            completed: self.supervisor.completed(),
            failed: self.supervisor.failed(),
            exhausted: self.pool.is_exhausted(),
        }
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    pub fn preload_report(&self) -> &PreloadReport {
        self.pool.preload_report()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Stop accepting submissions. Idempotent and non-blocking.
    pub fn initiate_shutdown(&self) {
        if !self.dispatcher.begin_drain(self.config.shutdown_policy) {
            tracing::debug!(state = %self.dispatcher.state(), "Shutdown already initiated");
        }
    }

    /// Initiate shutdown, wait for every outstanding task to deliver its
    /// result, then close the pool. Safe to call more than once.
    pub async fn wait_until_shutdown(&self) {
        self.initiate_shutdown();
        self.supervisor.wait_idle().await;

        let mut dispatch_loop = self.dispatch_loop.lock().await;
        let Some(handle) = dispatch_loop.take() else {
            return;
        };

        self.dispatcher.stop();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Dispatch loop ended abnormally");
        }
        self.pool.close().await;
        self.dispatcher.mark_shutdown();
        tracing::info!(
            completed = self.supervisor.completed(),
            failed = self.supervisor.failed(),
            "Broker shut down"
        );
    }

    /// Run an application workload against this broker.
    pub async fn simulate_app<A>(self: &Arc<Self>, simulator: &A)
    where
        A: AppSimulator<F> + ?Sized,
    {
        tracing::info!(max_concurrency = self.max_concurrency(), "Starting app simulation");
        simulator.simulate_app(Arc::clone(self)).await;
        tracing::info!(
            completed = self.supervisor.completed(),
            failed = self.supervisor.failed(),
            "App simulation finished"
        );
    }
}

impl<F: SessionFactory> Drop for RBroker<F> {
    fn drop(&mut self) {
        self.dispatcher.abandon("broker dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{GatedWorker, MemoryFactory, MemorySession};
    use crate::worker::{FnWorker, WorkerError};

    fn worker(
        value: i64,
    ) -> FnWorker<impl FnOnce(&mut MemorySession) -> Result<serde_json::Value, WorkerError>> {
        FnWorker::new(move |_: &mut MemorySession| Ok(serde_json::json!(value)))
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = RBroker::new(
            BrokerConfig::new("memory://engine").with_pool_size(0),
            MemoryFactory::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(BrokerError::Config(ConfigError::ZeroPoolSize))
        ));
    }

    #[tokio::test]
    async fn all_preloads_failing_is_unavailable() {
        let result = RBroker::new(
            BrokerConfig::new("memory://engine").with_pool_size(2),
            MemoryFactory::new().failing_preloads(2),
        )
        .await;
        match result {
            Err(BrokerError::PoolUnavailable { requested, failures }) => {
                assert_eq!(requested, 2);
                assert_eq!(failures.len(), 2);
            }
            _ => panic!("expected PoolUnavailable"),
        }
    }

    #[tokio::test]
    async fn all_preloads_timing_out_is_preload_timeout() {
        let result = RBroker::new(
            BrokerConfig::new("memory://engine")
                .with_pool_size(2)
                .with_preload_timeout(Duration::from_millis(10)),
            MemoryFactory::new().with_preload_delay(Duration::from_millis(200)),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::PreloadTimeout(_))));
    }

    #[tokio::test]
    async fn status_reflects_activity() {
        let broker = RBroker::new(
            BrokerConfig::new("memory://engine").with_pool_size(2),
            MemoryFactory::new(),
        )
        .await
        .unwrap();

        let status = broker.status();
        assert_eq!(status.state, BrokerState::Running);
        assert_eq!(status.max_concurrency, 2);
        assert!(status.is_idle());
        assert!(!status.exhausted);

        let result = broker.execute(worker(1)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(broker.status().completed, 1);

        broker.wait_until_shutdown().await;
        let status = broker.status();
        assert_eq!(status.state, BrokerState::Shutdown);
        assert_eq!(status.outstanding, 0);
    }

    #[tokio::test]
    async fn submissions_rejected_after_shutdown() {
        let broker = RBroker::new(BrokerConfig::new("memory://engine"), MemoryFactory::new())
            .await
            .unwrap();
        broker.initiate_shutdown();
        broker.initiate_shutdown();

        assert_eq!(
            broker.submit(worker(1)).unwrap_err(),
            AdmissionError::NotRunning {
                state: BrokerState::Draining
            }
        );
        broker.wait_until_shutdown().await;
        broker.wait_until_shutdown().await;
        assert_eq!(broker.state(), BrokerState::Shutdown);
    }

    #[tokio::test]
    async fn dropping_broker_aborts_queued_tasks() {
        let broker = RBroker::new(BrokerConfig::new("memory://engine"), MemoryFactory::new())
            .await
            .unwrap();
        let (gate_tx, gate_rx) = oneshot::channel();
        let running = broker.submit(GatedWorker::new(gate_rx)).unwrap();
        let queued = broker.submit(worker(2)).unwrap();
        let (tx, called) = oneshot::channel();
        broker
            .submit_with_callback(worker(3), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        drop(broker);
        gate_tx.send(()).unwrap();

        let limit = Duration::from_secs(2);
        let queued = tokio::time::timeout(limit, queued.wait()).await.unwrap();
        assert_eq!(
            queued.error(),
            Some(&crate::task::TaskError::Aborted("broker dropped".into()))
        );
        let called = tokio::time::timeout(limit, called).await.unwrap().unwrap();
        assert_eq!(called.status, crate::task::TaskStatus::Failed);
        let running = tokio::time::timeout(limit, running.wait()).await.unwrap();
        assert!(running.is_success());
    }

    #[test]
    fn admission_error_messages() {
        assert_eq!(
            AdmissionError::NotRunning {
                state: BrokerState::Draining
            }
            .to_string(),
            "broker is not accepting tasks (state: draining)"
        );
        assert_eq!(
            AdmissionError::QueueFull { capacity: 4 }.to_string(),
            "task queue is full (capacity 4)"
        );
    }
}
