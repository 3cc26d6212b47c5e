//! Worker contract: the caller-supplied unit of work run against a session.

use async_trait::async_trait;

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The task failed; the session is still usable.
    #[error("{0}")]
    Failed(String),

    /// The task failed and left the session in an unknown state.
    #[error("session corrupted: {0}")]
    SessionCorrupted(String),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::SessionCorrupted(message.into())
    }

    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::SessionCorrupted(_))
    }
}

/// A unit of work executed exactly once against a leased session.
///
/// Implementations translate their inputs into engine requests through the
/// session and turn the engine's response into a JSON output.
#[async_trait]
pub trait Worker<S: Session>: Send + 'static {
    async fn call(&mut self, session: &mut S) -> Result<serde_json::Value, WorkerError>;
}

/// Adapts a synchronous closure into a [`Worker`].
///
/// The closure runs on the executing task, so it should not block for long.
pub struct FnWorker<F> {
    f: Option<F>,
}

impl<F> FnWorker<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

#[async_trait]
impl<S, F> Worker<S> for FnWorker<F>
where
    S: Session,
    F: FnOnce(&mut S) -> Result<serde_json::Value, WorkerError> + Send + 'static,
{
    async fn call(&mut self, session: &mut S) -> Result<serde_json::Value, WorkerError> {
        let f = self
            .f
            .take()
            .ok_or_else(|| WorkerError::failed("worker already called"))?;
        f(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        calls: usize,
    }

    impl Session for Counter {}

    #[tokio::test]
    async fn fn_worker_runs_once() {
        let mut session = Counter { calls: 0 };
        let mut worker = FnWorker::new(|s: &mut Counter| {
            s.calls += 1;
            Ok(serde_json::json!(s.calls))
        });

        let first = worker.call(&mut session).await;
        assert_eq!(first, Ok(serde_json::json!(1)));

        let second = worker.call(&mut session).await;
        assert_eq!(second, Err(WorkerError::failed("worker already called")));
        assert_eq!(session.calls, 1);
    }

    #[test]
    fn only_corruption_breaks_session() {
        assert!(!WorkerError::failed("bad input").breaks_session());
        assert!(WorkerError::corrupted("workspace lost").breaks_session());
    }

    #[test]
    fn worker_error_display() {
        assert_eq!(WorkerError::failed("bad input").to_string(), "bad input");
        assert_eq!(
            WorkerError::corrupted("workspace lost").to_string(),
            "session corrupted: workspace lost"
        );
    }
}
