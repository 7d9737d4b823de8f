//! Liveness probes for the health endpoint.

use async_trait::async_trait;
use std::sync::Arc;

/// One upstream dependency check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the dependency is reachable and synced.
    async fn check(&self) -> Result<(), String>;
}

/// A probe that always reports healthy; stands in for dependencies a
/// deployment does not wire.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Probes for the three upstream dependencies the node reports on.
#[derive(Clone)]
pub struct Prober {
    pub beacon: Arc<dyn HealthProbe>,
    pub execution: Arc<dyn HealthProbe>,
    pub event_sync: Arc<dyn HealthProbe>,
}

impl Prober {
    pub fn new(
        beacon: Arc<dyn HealthProbe>,
        execution: Arc<dyn HealthProbe>,
        event_sync: Arc<dyn HealthProbe>,
    ) -> Self {
        Prober {
            beacon,
            execution,
            event_sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl HealthProbe for Failing {
        async fn check(&self) -> Result<(), String> {
            Err("connection refused".into())
        }
    }

    #[tokio::test]
    async fn probe_results_propagate() {
        let prober = Prober::new(
            Arc::new(AlwaysHealthy),
            Arc::new(Failing),
            Arc::new(AlwaysHealthy),
        );
        assert!(prober.beacon.check().await.is_ok());
        assert!(prober.execution.check().await.is_err());
    }
}
