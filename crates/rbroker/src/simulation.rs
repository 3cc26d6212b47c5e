//! Application workloads driven against a live broker.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::RBroker;
use crate::session::SessionFactory;

/// A synthetic application that submits work to a running broker, e.g. to
/// measure throughput at the pool's concurrency limit.
///
/// The simulator owns submission and result handling; the broker only
/// provides the facade. Shutdown stays with the caller.
#[async_trait]
pub trait AppSimulator<F: SessionFactory>: Send + Sync {
    async fn simulate_app(&self, broker: Arc<RBroker<F>>);
}
