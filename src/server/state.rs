use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::ServerConfig;
use crate::catalog_store::CatalogStore;
use crate::election::ElectionHandle;
use crate::health::HealthAggregator;
use crate::ingest::ChangeEvent;

pub type GuardedCatalogStore = Arc<dyn CatalogStore>;
pub type GuardedHealthAggregator = Arc<HealthAggregator>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub catalog_store: GuardedCatalogStore,
    pub health: GuardedHealthAggregator,
    pub election: ElectionHandle,
    /// Push path into the reconciliation pipeline for bucket notifications.
    pub notifications_tx: mpsc::Sender<ChangeEvent>,
}

impl FromRef<ServerState> for GuardedHealthAggregator {
    fn from_ref(input: &ServerState) -> Self {
        input.health.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
