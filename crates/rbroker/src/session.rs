//! Session contracts consumed by the pool.
//!
//! The broker never looks inside a session. It only creates, preloads, leases
//! and closes them; talking to the engine is the job of the factory and the
//! workers that run against a leased session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Credentials, PreloadDirective};

/// Unique identifier for a pool session.
///
/// A replacement session gets a fresh id, so an id is never reissued after
/// its session breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a factory needs to open one session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub id: SessionId,
    pub endpoint: String,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreloadError {
    #[error("failed to create session: {0}")]
    Create(String),
    #[error("failed to preload {resource}: {message}")]
    Preload { resource: String, message: String },
    #[error("preload timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl PreloadError {
    pub fn create(message: impl Into<String>) -> Self {
        Self::Create(message.into())
    }

    pub fn preload(directive: &PreloadDirective, message: impl Into<String>) -> Self {
        Self::Preload {
            resource: directive.resource(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("failed to close session: {0}")]
    Close(String),
}

/// A leased, stateful execution context on the remote engine.
#[async_trait]
pub trait Session: Send + 'static {
    /// Release remote resources. Called once when the session leaves the pool
    /// cleanly (broker shutdown or replacement after breaking).
    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Opens and primes sessions for the pool.
///
/// Invoked once per slot at construction, and again for each replacement
/// attempt when a broken session is recycled.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    async fn create(&self, spec: &SessionSpec) -> Result<Self::Session, PreloadError>;

    /// Prime a fresh session with shared state before it becomes idle.
    async fn preload(
        &self,
        _session: &mut Self::Session,
        _directives: &[PreloadDirective],
    ) -> Result<(), PreloadError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn session_id_serializes_transparently() {
        let id = SessionId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn preload_error_names_resource() {
        let directive = PreloadDirective::new("model.rData", "scoring", "admin");
        let err = PreloadError::preload(&directive, "file not found");
        assert_eq!(
            err.to_string(),
            "failed to preload admin/scoring/model.rData: file not found"
        );
    }
}
