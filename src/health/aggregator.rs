//! Shared health state owned by the aggregator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Health of a single external dependency.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
}

/// Aggregates per-dependency health reports into one boolean signal.
///
/// The component map is owned here and only reachable through `report` and
/// `snapshot`; probe loops never share state with each other. Subscribers
/// observe the aggregate AND of all registered components and are only woken
/// when it flips (edge-triggered), so a flapping-free dependency set costs
/// downstream consumers nothing.
pub struct HealthAggregator {
    components: Mutex<HashMap<String, ComponentHealth>>,
    aggregate_tx: watch::Sender<bool>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        let (aggregate_tx, _) = watch::channel(false);
        Self {
            components: Mutex::new(HashMap::new()),
            aggregate_tx,
        }
    }

    /// Register a dependency. Components start unhealthy until their first
    /// successful probe report.
    pub fn register_component(&self, name: &str) {
        let mut components = self.components.lock().unwrap();
        components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth {
                name: name.to_string(),
                healthy: false,
                last_checked: Utc::now(),
            });
    }

    /// Record a probe result and recompute the aggregate signal.
    pub fn report(&self, name: &str, healthy: bool) {
        let aggregate = {
            let mut components = self.components.lock().unwrap();
            let entry = components
                .entry(name.to_string())
                .or_insert_with(|| ComponentHealth {
                    name: name.to_string(),
                    healthy,
                    last_checked: Utc::now(),
                });
            entry.healthy = healthy;
            entry.last_checked = Utc::now();
            components.values().all(|c| c.healthy)
        };

        self.aggregate_tx.send_if_modified(|current| {
            if *current != aggregate {
                *current = aggregate;
                true
            } else {
                false
            }
        });
    }

    /// Current per-component breakdown, sorted by name for stable output.
    pub fn snapshot(&self) -> Vec<ComponentHealth> {
        let components = self.components.lock().unwrap();
        let mut snapshot: Vec<ComponentHealth> = components.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Whether every registered component passed its last check.
    pub fn is_healthy(&self) -> bool {
        *self.aggregate_tx.borrow()
    }

    /// Subscribe to aggregate health transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.aggregate_tx.subscribe()
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_start_unhealthy() {
        let aggregator = HealthAggregator::new();
        aggregator.register_component("db");
        aggregator.register_component("broker");

        assert!(!aggregator.is_healthy());
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|c| !c.healthy));
    }

    #[test]
    fn test_aggregate_is_and_of_components() {
        let aggregator = HealthAggregator::new();
        for name in ["db", "broker", "blob"] {
            aggregator.register_component(name);
        }

        aggregator.report("db", true);
        aggregator.report("blob", true);
        aggregator.report("broker", false);

        assert!(!aggregator.is_healthy());
        let snapshot = aggregator.snapshot();
        let broker = snapshot.iter().find(|c| c.name == "broker").unwrap();
        let db = snapshot.iter().find(|c| c.name == "db").unwrap();
        assert!(!broker.healthy);
        assert!(db.healthy);

        aggregator.report("broker", true);
        assert!(aggregator.is_healthy());
    }

    #[tokio::test]
    async fn test_subscribers_only_see_transitions() {
        let aggregator = HealthAggregator::new();
        aggregator.register_component("db");
        let mut rx = aggregator.subscribe();
        rx.mark_unchanged();

        aggregator.report("db", true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());

        // Re-reporting the same status must not wake subscribers.
        aggregator.report("db", true);
        assert!(!rx.has_changed().unwrap());

        aggregator.report("db", false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_report_before_register_is_allowed() {
        let aggregator = HealthAggregator::new();
        aggregator.report("db", true);
        assert!(aggregator.is_healthy());
        assert_eq!(aggregator.snapshot().len(), 1);
    }
}
