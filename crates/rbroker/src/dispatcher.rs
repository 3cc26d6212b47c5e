//! Dispatcher - matches queued tasks to free sessions.
//!
//! The admission lock is the single ordering point: sequence numbers, the
//! queue, the broker state and the direct-dispatch decision are all taken
//! under it. A task bypasses the queue only when the queue is empty, so FIFO
//! order holds across concurrent submitters.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::broker::AdmissionError;
use crate::config::ShutdownPolicy;
use crate::events::{BrokerEvent, EventSender};
use crate::pool::{ReleaseOutcome, SessionLease, SessionPool};
use crate::queue::{QueueEntry, TaskQueue};
use crate::session::{Session, SessionFactory};
use crate::state::BrokerState;
use crate::supervisor::{CancelQueued, ResultSink, TaskSupervisor, panic_message};
use crate::task::{TaskError, TaskId, TaskRecord, TaskStatus};
use crate::worker::{Worker, WorkerError};

pub(crate) struct QueuedTask<S: Session> {
    record: TaskRecord,
    worker: Box<dyn Worker<S>>,
    sink: ResultSink,
}

impl<S: Session> QueueEntry for QueuedTask<S> {
    fn task_id(&self) -> TaskId {
        self.record.id
    }
}

struct DispatchState<S: Session> {
    queue: TaskQueue<QueuedTask<S>>,
    state: BrokerState,
    next_sequence: u64,
}

pub(crate) struct Dispatcher<F: SessionFactory> {
    pool: Arc<SessionPool<F>>,
    inner: StdMutex<DispatchState<F::Session>>,
    work: Notify,
    supervisor: Arc<TaskSupervisor>,
    task_timeout: Option<Duration>,
    events: EventSender,
    stop: CancellationToken,
    runtime: Handle,
}

impl<F: SessionFactory> Dispatcher<F> {
    pub fn new(
        pool: Arc<SessionPool<F>>,
        supervisor: Arc<TaskSupervisor>,
        queue_capacity: Option<usize>,
        task_timeout: Option<Duration>,
        events: EventSender,
        runtime: Handle,
    ) -> Self {
        Self {
            pool,
            inner: StdMutex::new(DispatchState {
                queue: TaskQueue::new(queue_capacity),
                state: BrokerState::Created,
                next_sequence: 1,
            }),
            work: Notify::new(),
            supervisor,
            task_timeout,
            events,
            stop: CancellationToken::new(),
            runtime,
        }
    }

    /// Queue and state hold no invariants a panic could break mid-update.
    fn lock(&self) -> MutexGuard<'_, DispatchState<F::Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut DispatchState<F::Session>, to: BrokerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(from = %from, to = %to, "Broker state changed");
        self.events.emit(BrokerEvent::StateChanged { from, to });
    }

    pub fn state(&self) -> BrokerState {
        self.lock().state
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.state == BrokerState::Created {
            self.transition(&mut inner, BrokerState::Running);
        }
    }

    /// Admit a task: dispatch it now if the queue is empty and a session is
    /// free, otherwise append it to the queue.
    pub fn admit(
        self: &Arc<Self>,
        worker: Box<dyn Worker<F::Session>>,
        sink: ResultSink,
    ) -> Result<TaskRecord, AdmissionError> {
        let mut inner = self.lock();

        if !inner.state.accepts_submissions() {
            tracing::warn!(state = %inner.state, "Submission rejected - broker not running");
            return Err(AdmissionError::NotRunning { state: inner.state });
        }
        if self.pool.is_exhausted() {
            tracing::warn!("Submission rejected - pool exhausted");
            return Err(AdmissionError::PoolExhausted);
        }

        let record = TaskRecord::new(inner.next_sequence);
        let task = QueuedTask {
            record: record.clone(),
            worker,
            sink,
        };

        if inner.queue.is_empty()
            && let Some(lease) = self.pool.try_acquire()
        {
            inner.next_sequence += 1;
            self.supervisor.register(record.id, TaskStatus::Running);
            drop(inner);
            tracing::debug!(
                target: "rbroker::task",
                task_id = %record.id,
                sequence = record.sequence,
                "Task submitted - dispatching directly"
            );
            self.runtime.spawn(Arc::clone(self).execute(task, lease));
            return Ok(record);
        }

        match inner.queue.push(task) {
            Ok(()) => {
                inner.next_sequence += 1;
                self.supervisor.register(record.id, TaskStatus::Queued);
                let depth = inner.queue.len();
                drop(inner);
                tracing::debug!(
                    target: "rbroker::task",
                    task_id = %record.id,
                    sequence = record.sequence,
                    depth,
                    "Task submitted - queued"
                );
                self.work.notify_one();
                Ok(record)
            }
            Err((_, full)) => {
                tracing::warn!(capacity = full.capacity, "Submission rejected - queue full");
                Err(AdmissionError::QueueFull {
                    capacity: full.capacity,
                })
            }
        }
    }

    /// Dispatch loop. Runs until `stop()`.
    pub async fn run(self: Arc<Self>) {
        tracing::debug!("Dispatch loop started");
        loop {
            if !self.wait_for_work().await {
                break;
            }

            let lease = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                lease = self.pool.acquire() => lease,
            };

            let Some(lease) = lease else {
                self.abort_queued("no serviceable sessions remain");
                if self.pool.is_exhausted() {
                    continue;
                }
                break;
            };

            let task = {
                let mut inner = self.lock();
                match inner.queue.pop_front() {
                    Some(task) => {
                        self.supervisor.mark_running(&task.record.id);
                        task
                    }
                    None => {
                        // Queue emptied while waiting (cancel or flush).
                        drop(lease.into_idle());
                        continue;
                    }
                }
            };
            self.runtime.spawn(Arc::clone(&self).execute(task, lease));
        }
        tracing::debug!("Dispatch loop exiting");
    }

    /// Returns `false` when stopped.
    async fn wait_for_work(&self) -> bool {
        loop {
            let notified = self.work.notified();
            if self.stop.is_cancelled() {
                return false;
            }
            if !self.lock().queue.is_empty() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.stop.cancelled() => return false,
            }
        }
    }

    async fn execute(self: Arc<Self>, task: QueuedTask<F::Session>, mut lease: SessionLease<F::Session>) {
        let QueuedTask {
            record,
            mut worker,
            sink,
        } = task;
        let session_id = lease.id();
        let dispatched = Instant::now();
        tracing::debug!(
            target: "rbroker::task",
            task_id = %record.id,
            sequence = record.sequence,
            session = %session_id,
            "Task dispatched"
        );

        let Some(mut session) = lease.take_session() else {
            lease.release(ReleaseOutcome::Broken("lease held no session".to_string()));
            let result = record.finish(
                Err(TaskError::Aborted("lease held no session".to_string())),
                Some(session_id),
                Some(dispatched),
            );
            self.supervisor.finish(result, sink);
            return;
        };

        // Polled in place: on timeout or panic the session goes back to the
        // lease and the repair loop closes it.
        let call = AssertUnwindSafe(worker.call(&mut session)).catch_unwind();
        let completed = match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.ok(),
            None => Some(call.await),
        };
        lease.restore(session);

        let (outcome, release) = match completed {
            Some(Ok(Ok(output))) => (Ok(output), ReleaseOutcome::Healthy),
            Some(Ok(Err(e))) => {
                let release = if e.breaks_session() {
                    ReleaseOutcome::Broken(e.to_string())
                } else {
                    ReleaseOutcome::Healthy
                };
                let error = match e {
                    WorkerError::Failed(msg) => TaskError::Failed(msg),
                    WorkerError::SessionCorrupted(msg) => TaskError::SessionCorrupted(msg),
                };
                (Err(error), release)
            }
            Some(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                let release = ReleaseOutcome::Broken(format!("task panicked: {message}"));
                (Err(TaskError::Panicked(message)), release)
            }
            None => {
                let limit = self.task_timeout.unwrap_or_default();
                (
                    Err(TaskError::Timeout(limit)),
                    ReleaseOutcome::Broken(format!("task timed out after {limit:?}")),
                )
            }
        };

        lease.release(release);
        let result = record.finish(outcome, Some(session_id), Some(dispatched));
        self.supervisor.finish(result, sink);
    }

    fn cancel_all(&self, tasks: Vec<QueuedTask<F::Session>>, error: TaskError) -> usize {
        let count = tasks.len();
        for task in tasks {
            let result = task.record.finish(Err(error.clone()), None, None);
            if matches!(task.sink, ResultSink::Callback(_)) {
                // Callbacks run on the runtime, never on the cancelling thread.
                let supervisor = Arc::clone(&self.supervisor);
                let sink = task.sink;
                self.runtime.spawn(async move { supervisor.finish(result, sink) });
            } else {
                self.supervisor.finish(result, task.sink);
            }
        }
        count
    }

    /// Stop dispatching and abort whatever is still queued. In-flight tasks
    /// run to completion.
    pub fn abandon(&self, reason: &str) {
        self.stop();
        self.abort_queued(reason);
    }

    fn abort_queued(&self, reason: &str) {
        let tasks = self.lock().queue.drain();
        if tasks.is_empty() {
            return;
        }
        tracing::error!(count = tasks.len(), %reason, "Aborting queued tasks");
        self.cancel_all(tasks, TaskError::Aborted(reason.to_string()));
    }

    /// Cancel every queued task. In-flight tasks are unaffected.
    pub fn flush(&self) -> usize {
        let tasks = self.lock().queue.drain();
        let count = self.cancel_all(tasks, TaskError::Cancelled);
        if count > 0 {
            tracing::info!(count, "Flushed queued tasks");
        }
        count
    }

    /// Stop accepting work. Returns `false` if already past `Running`.
    pub fn begin_drain(&self, policy: ShutdownPolicy) -> bool {
        let cancelled = {
            let mut inner = self.lock();
            if inner.state != BrokerState::Running {
                return false;
            }
            self.transition(&mut inner, BrokerState::Draining);
            match policy {
                ShutdownPolicy::Drain => Vec::new(),
                ShutdownPolicy::CancelQueued => inner.queue.drain(),
            }
        };
        let count = self.cancel_all(cancelled, TaskError::Cancelled);
        tracing::info!(?policy, cancelled = count, "Shutdown initiated");
        self.work.notify_one();
        true
    }

    pub fn mark_shutdown(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, BrokerState::Shutdown);
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl<F: SessionFactory> CancelQueued for Dispatcher<F> {
    fn cancel_queued(&self, id: &TaskId) -> bool {
        let Some(task) = self.lock().queue.remove(id) else {
            return false;
        };
        tracing::debug!(target: "rbroker::task", task_id = %id, "Queued task cancelled");
        self.cancel_all(vec![task], TaskError::Cancelled);
        true
    }
}
