//! Health-driven failover.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::election::ElectionHandle;

/// Forces a leader to relinquish when aggregate health degrades.
///
/// Subscribes to the health aggregate and requests a re-election on each
/// healthy-to-unhealthy edge while this replica is leader. A replica whose
/// health recovers before the re-election completes may still lose
/// leadership; that bias toward relinquishing is intended.
pub struct FailoverController {
    health_rx: watch::Receiver<bool>,
    election: ElectionHandle,
}

impl FailoverController {
    pub fn new(health_rx: watch::Receiver<bool>, election: ElectionHandle) -> Self {
        Self {
            health_rx,
            election,
        }
    }

    /// Watch health transitions until the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let mut last_healthy = *self.health_rx.borrow();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = self.health_rx.changed() => {
                    if changed.is_err() {
                        // Aggregator dropped; nothing left to watch.
                        break;
                    }
                    let healthy = *self.health_rx.borrow_and_update();
                    let degraded_edge = last_healthy && !healthy;
                    last_healthy = healthy;

                    if degraded_edge && self.election.is_leader() {
                        warn!("Dependencies degraded while holding leadership, forcing re-election");
                        if let Err(e) = self.election.re_election().await {
                            error!("Failed to request re-election: {}", e);
                        }
                    }
                }
            }
        }
        info!("Failover controller stopped");
    }
}
