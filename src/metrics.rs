//! Service Metrics
//!
//! Prometheus counters and gauges for pool lifecycle and eviction, kept in a
//! private registry so several services can coexist in one process (tests).

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics of one pool service instance
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    pub pools_created: IntCounter,
    pub pools_destroyed: IntCounter,
    pub pools_live: IntGauge,
    pub connections_opened: IntCounter,
    pub handles_live: IntGauge,
    pub evictions_requested: IntCounter,
    pub evictions_rejected: IntCounterVec,
    pub handles_evicted: IntCounter,
    pub notification_failures: IntCounterVec,
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics")
            .field("pools_live", &self.pools_live.get())
            .field("handles_live", &self.handles_live.get())
            .finish()
    }
}

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;
    Ok(metric)
}

fn new_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric definition failed: {}", e))
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("pool_membership".into()), None).map_err(new_err)?;

        let pools_created = register(
            &registry,
            IntCounter::new("pools_created_total", "Pools created").map_err(new_err)?,
        )?;
        let pools_destroyed = register(
            &registry,
            IntCounter::new("pools_destroyed_total", "Pools destroyed").map_err(new_err)?,
        )?;
        let pools_live = register(
            &registry,
            IntGauge::new("pools_live", "Pools currently active").map_err(new_err)?,
        )?;
        let connections_opened = register(
            &registry,
            IntCounter::new("connections_opened_total", "Handles registered").map_err(new_err)?,
        )?;
        let handles_live = register(
            &registry,
            IntGauge::new("handles_live", "Handles currently connected").map_err(new_err)?,
        )?;
        let evictions_requested = register(
            &registry,
            IntCounter::new("evictions_requested_total", "Eviction requests received")
                .map_err(new_err)?,
        )?;
        let evictions_rejected = register(
            &registry,
            IntCounterVec::new(
                Opts::new("evictions_rejected_total", "Eviction requests rejected"),
                &["kind"],
            )
            .map_err(new_err)?,
        )?;
        let handles_evicted = register(
            &registry,
            IntCounter::new("handles_evicted_total", "Handles removed by eviction")
                .map_err(new_err)?,
        )?;
        let notification_failures = register(
            &registry,
            IntCounterVec::new(
                Opts::new("notification_failures_total", "Revocations not delivered"),
                &["outcome"],
            )
            .map_err(new_err)?,
        )?;

        Ok(Self {
            registry,
            pools_created,
            pools_destroyed,
            pools_live,
            connections_opened,
            handles_live,
            evictions_requested,
            evictions_rejected,
            handles_evicted,
            notification_failures,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metric encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
