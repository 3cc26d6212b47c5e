//! Broker configuration.
//!
//! Captured once at construction and moved into the broker; nothing here is
//! mutated after the pool is preloaded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Credential handed to the session factory for each slot.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Basic { username: String, password: String },
    Token { token: String },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// A named resource loaded into every session before it enters service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadDirective {
    pub filename: String,
    pub directory: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PreloadDirective {
    pub fn new(
        filename: impl Into<String>,
        directory: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            directory: directory.into(),
            author: author.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// `author/directory/filename`, used in logs and preload errors.
    pub fn resource(&self) -> String {
        format!("{}/{}/{}", self.author, self.directory, self.filename)
    }
}

/// What happens to queued tasks when shutdown is initiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Queued tasks still run before the pool closes.
    #[default]
    Drain,
    /// Queued tasks are delivered a cancelled result; in-flight tasks finish.
    CancelQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint must not be empty")]
    EmptyEndpoint,
    #[error("pool size must be at least 1")]
    ZeroPoolSize,
    #[error("queue capacity must be at least 1 when bounded")]
    ZeroQueueCapacity,
    #[error("task timeout must be non-zero")]
    ZeroTaskTimeout,
    #[error("preload timeout must be non-zero")]
    ZeroPreloadTimeout,
    #[error("event capacity must be at least 1")]
    ZeroEventCapacity,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub endpoint: String,
    pub credentials: Option<Credentials>,
    pub pool_size: usize,
    pub preload: Vec<PreloadDirective>,
    /// `None` means unbounded.
    pub queue_capacity: Option<usize>,
    pub task_timeout: Option<Duration>,
    pub preload_timeout: Duration,
    pub replace_broken: bool,
    pub shutdown_policy: ShutdownPolicy,
    pub event_capacity: usize,
}

impl BrokerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials: None,
            pool_size: 1,
            preload: Vec::new(),
            queue_capacity: None,
            task_timeout: None,
            preload_timeout: Duration::from_secs(300),
            replace_broken: true,
            shutdown_policy: ShutdownPolicy::default(),
            event_capacity: 256,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_preload(mut self, directive: PreloadDirective) -> Self {
        self.preload.push(directive);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_unbounded_queue(mut self) -> Self {
        self.queue_capacity = None;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_preload_timeout(mut self, timeout: Duration) -> Self {
        self.preload_timeout = timeout;
        self
    }

    pub fn with_replace_broken(mut self, replace: bool) -> Self {
        self.replace_broken = replace;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTaskTimeout);
        }
        if self.preload_timeout.is_zero() {
            return Err(ConfigError::ZeroPreloadTimeout);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BrokerConfig::new("http://localhost:7400/deployr");
        assert_eq!(config.pool_size, 1);
        assert!(config.queue_capacity.is_none());
        assert!(config.task_timeout.is_none());
        assert!(config.replace_broken);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = BrokerConfig::new("http://engine")
            .with_credentials(Credentials::basic("testuser", "changeme"))
            .with_pool_size(10)
            .with_preload(PreloadDirective::new(
                "insurModel.rData",
                "example-fraud-score",
                "testuser",
            ))
            .with_queue_capacity(50)
            .with_task_timeout(Duration::from_secs(30))
            .with_shutdown_policy(ShutdownPolicy::CancelQueued);

        assert_eq!(config.pool_size, 10);
        assert_eq!(config.preload.len(), 1);
        assert_eq!(config.queue_capacity, Some(50));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.shutdown_policy, ShutdownPolicy::CancelQueued);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert_eq!(
            BrokerConfig::new("  ").validate(),
            Err(ConfigError::EmptyEndpoint)
        );
        assert_eq!(
            BrokerConfig::new("x").with_pool_size(0).validate(),
            Err(ConfigError::ZeroPoolSize)
        );
        assert_eq!(
            BrokerConfig::new("x").with_queue_capacity(0).validate(),
            Err(ConfigError::ZeroQueueCapacity)
        );
        assert_eq!(
            BrokerConfig::new("x")
                .with_task_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroTaskTimeout)
        );
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::basic("alice", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));

        let token = format!("{:?}", Credentials::token("s3cr3t"));
        assert!(!token.contains("s3cr3t"));
    }

    #[test]
    fn preload_directive_deserializes_without_version() {
        let directive: PreloadDirective = serde_json::from_str(
            r#"{"filename":"insurModel.rData","directory":"example-fraud-score","author":"testuser"}"#,
        )
        .unwrap();
        assert_eq!(directive.version, None);
        assert_eq!(
            directive.resource(),
            "testuser/example-fraud-score/insurModel.rData"
        );
    }
}
