//! Dependency probes and their polling loops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::HealthAggregator;
use crate::blob_store::BlobStore;
use crate::broker::BrokerConnector;
use crate::catalog_store::CatalogStore;
use crate::server::metrics;

/// A single connectivity check against one external dependency.
///
/// Probes carry no retry logic; cadence and retries are the polling loop's
/// concern.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    /// Component name as registered with the aggregator.
    fn name(&self) -> &'static str;

    /// Run one check and report whether the dependency responded.
    async fn check(&self) -> bool;
}

/// Pings the catalog database.
pub struct DatabaseProbe {
    store: Arc<dyn CatalogStore>,
}

impl DatabaseProbe {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyProbe for DatabaseProbe {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn check(&self) -> bool {
        self.store.ping().is_ok()
    }
}

/// Verifies the broker connection is still open.
pub struct BrokerProbe {
    connector: Arc<BrokerConnector>,
}

impl BrokerProbe {
    pub fn new(connector: Arc<BrokerConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl DependencyProbe for BrokerProbe {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn check(&self) -> bool {
        self.connector.is_open()
    }
}

/// Lists the media bucket to verify the blob store is reachable.
pub struct BlobStoreProbe {
    blob_store: Arc<dyn BlobStore>,
}

impl BlobStoreProbe {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl DependencyProbe for BlobStoreProbe {
    fn name(&self) -> &'static str {
        "blob"
    }

    async fn check(&self) -> bool {
        self.blob_store.probe().await.is_ok()
    }
}

/// A probe together with its polling interval.
pub struct ProbeSchedule {
    pub probe: Arc<dyn DependencyProbe>,
    pub interval: Duration,
}

/// Spawn one polling loop per probe.
///
/// Each loop registers its component, then reports every `interval` until the
/// token is cancelled. The returned handles let the supervisor await the
/// loops during shutdown.
pub fn spawn_probe_loops(
    aggregator: Arc<HealthAggregator>,
    schedules: Vec<ProbeSchedule>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    schedules
        .into_iter()
        .map(|schedule| {
            let aggregator = Arc::clone(&aggregator);
            let token = token.clone();
            aggregator.register_component(schedule.probe.name());
            tokio::spawn(run_probe_loop(
                aggregator,
                schedule.probe,
                schedule.interval,
                token,
            ))
        })
        .collect()
}

async fn run_probe_loop(
    aggregator: Arc<HealthAggregator>,
    probe: Arc<dyn DependencyProbe>,
    interval: Duration,
    token: CancellationToken,
) {
    let name = probe.name();
    let mut ticker = tokio::time::interval(interval);
    let mut last_status: Option<bool> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let healthy = probe.check().await;
                if last_status != Some(healthy) {
                    if healthy {
                        info!("Dependency '{}' is healthy", name);
                    } else {
                        warn!("Dependency '{}' failed its health check", name);
                    }
                }
                last_status = Some(healthy);
                metrics::set_component_health(name, healthy);
                aggregator.report(name, healthy);
            }
        }
    }
    debug!("Probe loop for '{}' stopped", name);
}
