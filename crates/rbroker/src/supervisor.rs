//! Task supervisor - tracks every admitted task until its result is delivered.
//!
//! The outstanding count lives in a watch channel so shutdown can wait for it
//! to reach zero without racing the completions that decrement it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{oneshot, watch};

use crate::events::{BrokerEvent, EventSender};
use crate::task::{TaskError, TaskId, TaskRecord, TaskResult, TaskStatus};

/// Callback invoked exactly once with a task's result.
pub type ResultCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

/// Where a task's result goes.
pub(crate) enum ResultSink {
    Channel(oneshot::Sender<TaskResult>),
    Callback(ResultCallback),
}

impl ResultSink {
    fn deliver(self, result: TaskResult) {
        let id = result.id;
        match self {
            Self::Channel(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!(task_id = %id, "Task handle dropped before result");
                }
            }
            Self::Callback(callback) => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))) {
                    tracing::error!(
                        task_id = %id,
                        panic = %panic_message(panic.as_ref()),
                        "Result callback panicked"
                    );
                }
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Removes a task from the queue if it has not been dispatched yet.
pub(crate) trait CancelQueued: Send + Sync {
    fn cancel_queued(&self, id: &TaskId) -> bool;
}

pub(crate) struct TaskSupervisor {
    tasks: DashMap<TaskId, TaskStatus>,
    outstanding: watch::Sender<usize>,
    completed: AtomicU64,
    failed: AtomicU64,
    events: EventSender,
}

impl TaskSupervisor {
    pub fn new(events: EventSender) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            tasks: DashMap::new(),
            outstanding,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            events,
        }
    }

    /// Track a newly admitted task. Must be called under the admission lock.
    pub fn register(&self, id: TaskId, status: TaskStatus) {
        self.tasks.insert(id, status);
        self.outstanding.send_modify(|n| *n += 1);
    }

    pub fn mark_running(&self, id: &TaskId) {
        if let Some(mut status) = self.tasks.get_mut(id) {
            *status = TaskStatus::Running;
        }
    }

    pub fn executing(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| *entry.value() == TaskStatus::Running)
            .count()
    }

    /// Deliver the terminal result, then drop the task from the outstanding
    /// count. Delivery happens first so a shutdown waiter never observes zero
    /// while a result is still in flight.
    pub fn finish(&self, result: TaskResult, sink: ResultSink) {
        let id = result.id;
        let status = result.status;
        self.tasks.remove(&id);

        if result.is_success() {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        match (&result.error, status) {
            (None, _) => tracing::info!(
                target: "rbroker::task",
                task_id = %id,
                sequence = result.sequence,
                session = ?result.session,
                time_on_call = ?result.time_on_call,
                "Task succeeded"
            ),
            (Some(e), TaskStatus::Cancelled) => {
                tracing::info!(target: "rbroker::task", task_id = %id, reason = %e, "Task cancelled")
            }
            (Some(e), TaskStatus::TimedOut) => {
                tracing::warn!(target: "rbroker::task", task_id = %id, session = ?result.session, error = %e, "Task timed out")
            }
            (Some(e), _) => {
                tracing::info!(target: "rbroker::task", task_id = %id, session = ?result.session, error = %e, "Task failed")
            }
        }

        self.events
            .emit(BrokerEvent::TaskCompleted { id, status });
        sink.deliver(result);
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Resolve once no admitted task is awaiting delivery.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Pollable handle for a submitted task.
pub struct TaskHandle {
    record: TaskRecord,
    receiver: Option<oneshot::Receiver<TaskResult>>,
    result: Option<TaskResult>,
    canceller: Arc<dyn CancelQueued>,
}

impl TaskHandle {
    pub(crate) fn new(
        record: TaskRecord,
        receiver: oneshot::Receiver<TaskResult>,
        canceller: Arc<dyn CancelQueued>,
    ) -> Self {
        Self {
            record,
            receiver: Some(receiver),
            result: None,
            canceller,
        }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    /// Submission order of this task.
    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }

    pub fn is_done(&mut self) -> bool {
        self.try_result().is_some()
    }

    /// The result, if it has been delivered. Never blocks.
    pub fn try_result(&mut self) -> Option<&TaskResult> {
        if self.result.is_none()
            && let Some(rx) = self.receiver.as_mut()
        {
            match rx.try_recv() {
                Ok(result) => {
                    self.result = Some(result);
                    self.receiver = None;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.result = Some(self.lost());
                    self.receiver = None;
                }
            }
        }
        self.result.as_ref()
    }

    pub async fn wait(mut self) -> TaskResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.receiver.take() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => self.lost(),
            },
            None => self.lost(),
        }
    }

    /// Block the current OS thread until the result arrives.
    ///
    /// Panics if called from within an async runtime, like
    /// `oneshot::Receiver::blocking_recv`.
    pub fn blocking_wait(mut self) -> TaskResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.receiver.take() {
            Some(rx) => match rx.blocking_recv() {
                Ok(result) => result,
                Err(_) => self.lost(),
            },
            None => self.lost(),
        }
    }

    /// Remove the task if it is still queued. The cancelled result is
    /// delivered through this handle. Returns `false` once dispatched.
    pub fn cancel(&self) -> bool {
        self.canceller.cancel_queued(&self.record.id)
    }

    fn lost(&self) -> TaskResult {
        tracing::error!(task_id = %self.record.id, "Task result sender dropped without delivery");
        self.record.finish(
            Err(TaskError::Aborted("result lost".to_string())),
            None,
            None,
        )
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.record.id)
            .field("sequence", &self.record.sequence)
            .field("done", &self.result.is_some())
            .finish()
    }
}
