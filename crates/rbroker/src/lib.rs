//! rbroker: task broker over a fixed pool of preloaded remote engine sessions.

mod broker;
mod config;
mod dispatcher;
mod events;
mod pool;
mod queue;
mod session;
mod simulation;
mod state;
mod supervisor;
mod task;
mod worker;

pub mod logging;

#[cfg(test)]
mod testutil;

pub use broker::{AdmissionError, BrokerError, BrokerStatus, RBroker};
pub use config::{BrokerConfig, ConfigError, Credentials, PreloadDirective, ShutdownPolicy};
pub use events::BrokerEvent;
pub use pool::{PoolSnapshot, PreloadFailure, PreloadReport, SessionSnapshot};
pub use session::{PreloadError, Session, SessionError, SessionFactory, SessionId, SessionSpec};
pub use simulation::AppSimulator;
pub use state::{BrokerState, SessionState};
pub use supervisor::{ResultCallback, TaskHandle};
pub use task::{TaskError, TaskId, TaskResult, TaskStatus};
pub use worker::{FnWorker, Worker, WorkerError};
