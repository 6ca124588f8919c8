//! Leader election state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{CoordinationError, Coordinator, KeyObservation};
use crate::server::metrics;

/// Configuration for one replica's participation in leader election.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// KV path of the mutual-exclusion key, unique per logical service.
    pub key: String,
    /// Name this replica registers under; also stored as the key's value.
    pub node_name: String,
    /// Session time-to-live; a crashed holder's key is released when this
    /// expires.
    pub session_ttl: Duration,
    /// Backend health-check identifiers attached to the session.
    pub checks: Vec<String>,
    /// Pause after coordination errors, and the blocking-observation window
    /// between acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            key: "service/cadenza/leader".to_string(),
            node_name: "cadenza".to_string(),
            session_ttl: Duration::from_secs(15),
            checks: Vec::new(),
            retry_interval: Duration::from_secs(5),
        }
    }
}

enum Command {
    ReElection,
}

/// Handle for observing and steering a running election loop.
#[derive(Clone)]
pub struct ElectionHandle {
    leader_rx: watch::Receiver<bool>,
    command_tx: mpsc::Sender<Command>,
}

impl ElectionHandle {
    /// Whether this replica currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Subscribe to leadership transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// Ask the election loop to release the key and contest it again. The
    /// request is a notification; the loop applies it at its next iteration.
    pub async fn re_election(&self) -> anyhow::Result<()> {
        self.command_tx
            .send(Command::ReElection)
            .await
            .map_err(|_| anyhow::anyhow!("election loop is not running"))
    }
}

/// Outcome of one session's contest, reported back to the outer loop.
enum ContestOutcome {
    Cancelled,
    Relinquished,
    CoordinationFailed,
}

enum ContestEvent {
    Cancelled,
    Renew,
    Command(Option<Command>),
    Observed(Result<KeyObservation, CoordinationError>),
}

/// Drives the Follower/Leader state machine against the coordination backend.
///
/// The replica is Follower whenever it does not hold the key. Coordination
/// failures are never fatal: the loop logs, reverts to Follower, and retries
/// with a fresh session after `retry_interval`.
pub struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
    config: ElectionConfig,
    leader_tx: watch::Sender<bool>,
    command_rx: mpsc::Receiver<Command>,
    commands_closed: bool,
}

/// Create an election loop and the handle used to observe it.
pub fn create_election(
    coordinator: Arc<dyn Coordinator>,
    config: ElectionConfig,
) -> (LeaderElection, ElectionHandle) {
    let (leader_tx, leader_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::channel(8);
    (
        LeaderElection {
            coordinator,
            config,
            leader_tx,
            command_rx,
            commands_closed: false,
        },
        ElectionHandle {
            leader_rx,
            command_tx,
        },
    )
}

impl LeaderElection {
    /// Run the election loop until the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Starting leader election for key '{}' as '{}'",
            self.config.key, self.config.node_name
        );

        while !token.is_cancelled() {
            let session = match self
                .coordinator
                .create_session(
                    &self.config.node_name,
                    self.config.session_ttl,
                    &self.config.checks,
                )
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to create coordination session: {}", e);
                    self.set_leader(false);
                    if pause(&token, self.config.retry_interval).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = self.contest(&token, &session).await;
            self.set_leader(false);
            if let Err(e) = self.coordinator.destroy_session(&session).await {
                debug!("Failed to destroy session {}: {}", session, e);
            }

            match outcome {
                ContestOutcome::Cancelled => break,
                ContestOutcome::Relinquished => {
                    info!("Leadership relinquished, re-entering election");
                    if pause(&token, self.config.retry_interval).await {
                        break;
                    }
                }
                ContestOutcome::CoordinationFailed => {
                    if pause(&token, self.config.retry_interval).await {
                        break;
                    }
                }
            }
        }

        self.set_leader(false);
        info!("Election loop stopped");
    }

    /// Contest and hold the key under one session.
    async fn contest(&mut self, token: &CancellationToken, session: &str) -> ContestOutcome {
        let mut is_leader = false;
        let mut last_index = 0u64;
        let mut renew = tokio::time::interval(self.config.session_ttl / 2);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !is_leader {
                match self
                    .coordinator
                    .acquire_key(&self.config.key, session, &self.config.node_name)
                    .await
                {
                    Ok(true) => {
                        info!("{}: I'm the leader!", self.config.node_name);
                        is_leader = true;
                        self.set_leader(true);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to acquire leader key: {}", e);
                        return ContestOutcome::CoordinationFailed;
                    }
                }
            }

            let event = tokio::select! {
                _ = token.cancelled() => ContestEvent::Cancelled,
                _ = renew.tick() => ContestEvent::Renew,
                cmd = self.command_rx.recv(), if !self.commands_closed => ContestEvent::Command(cmd),
                observed = self.coordinator.observe_key(
                    &self.config.key,
                    last_index,
                    self.config.retry_interval,
                ) => ContestEvent::Observed(observed),
            };

            match event {
                ContestEvent::Cancelled => {
                    if is_leader {
                        self.set_leader(false);
                        if let Err(e) = self
                            .coordinator
                            .release_key(&self.config.key, session)
                            .await
                        {
                            debug!("Failed to release leader key on shutdown: {}", e);
                        }
                    }
                    return ContestOutcome::Cancelled;
                }
                ContestEvent::Renew => {
                    if let Err(e) = self.coordinator.renew_session(session).await {
                        warn!("Failed to renew coordination session: {}", e);
                        self.set_leader(false);
                        return ContestOutcome::CoordinationFailed;
                    }
                }
                ContestEvent::Command(Some(Command::ReElection)) => {
                    if is_leader {
                        info!(
                            "{}: relinquishing leadership for re-election",
                            self.config.node_name
                        );
                        self.set_leader(false);
                        if let Err(e) = self
                            .coordinator
                            .release_key(&self.config.key, session)
                            .await
                        {
                            warn!("Failed to release leader key: {}", e);
                        }
                        return ContestOutcome::Relinquished;
                    }
                    debug!("Re-election requested while follower; nothing to release");
                }
                ContestEvent::Command(None) => {
                    // Every handle dropped; keep contesting, stop polling commands.
                    self.commands_closed = true;
                }
                ContestEvent::Observed(Ok(observation)) => {
                    last_index = observation.index;
                    if is_leader && observation.holder.as_deref() != Some(session) {
                        info!("{}: I'm no longer the leader!", self.config.node_name);
                        is_leader = false;
                        self.set_leader(false);
                    }
                }
                ContestEvent::Observed(Err(e)) => {
                    warn!("Failed to observe leader key: {}", e);
                    self.set_leader(false);
                    return ContestOutcome::CoordinationFailed;
                }
            }
        }
    }

    fn set_leader(&self, is_leader: bool) {
        metrics::set_leader(is_leader);
        self.leader_tx.send_if_modified(|current| {
            if *current != is_leader {
                *current = is_leader;
                true
            } else {
                false
            }
        });
    }
}

/// Sleep unless cancelled first. Returns true when the token fired.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::MemoryCoordinator;

    fn test_config(name: &str) -> ElectionConfig {
        ElectionConfig {
            key: "service/test/leader".to_string(),
            node_name: name.to_string(),
            session_ttl: Duration::from_secs(1),
            checks: Vec::new(),
            retry_interval: Duration::from_millis(50),
        }
    }

    async fn wait_for_leader(handle: &ElectionHandle, expected: bool) {
        let mut rx = handle.subscribe();
        for _ in 0..100 {
            if *rx.borrow() == expected {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        }
        panic!("leadership never became {}", expected);
    }

    #[tokio::test]
    async fn test_single_replica_becomes_leader() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (election, handle) = create_election(coordinator, test_config("solo"));
        let token = CancellationToken::new();
        let task = tokio::spawn(election.run(token.clone()));

        wait_for_leader(&handle, true).await;

        token.cancel();
        task.await.unwrap();
        assert!(!handle.is_leader());
    }

    #[tokio::test]
    async fn test_unreachable_backend_leaves_replica_follower() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        coordinator.set_unreachable(true);
        let (election, handle) =
            create_election(Arc::clone(&coordinator) as Arc<dyn Coordinator>, test_config("n1"));
        let token = CancellationToken::new();
        let task = tokio::spawn(election.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_leader());

        // The loop keeps retrying and wins once the backend comes back.
        coordinator.set_unreachable(false);
        wait_for_leader(&handle, true).await;

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relinquish_hands_leadership_over() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (election_a, handle_a) =
            create_election(Arc::clone(&coordinator) as Arc<dyn Coordinator>, test_config("a"));
        let (election_b, handle_b) =
            create_election(Arc::clone(&coordinator) as Arc<dyn Coordinator>, test_config("b"));
        let token = CancellationToken::new();
        let task_a = tokio::spawn(election_a.run(token.clone()));

        wait_for_leader(&handle_a, true).await;
        let task_b = tokio::spawn(election_b.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle_b.is_leader());

        handle_a.re_election().await.unwrap();
        wait_for_leader(&handle_b, true).await;

        token.cancel();
        task_a.await.unwrap();
        task_b.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_leadership_exclusivity_under_churn() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let token = CancellationToken::new();
        let mut handles = Vec::new();
        let mut tasks = Vec::new();

        for name in ["r1", "r2", "r3"] {
            let (election, handle) = create_election(
                Arc::clone(&coordinator) as Arc<dyn Coordinator>,
                test_config(name),
            );
            tasks.push(tokio::spawn(election.run(token.clone())));
            handles.push(handle);
        }

        // Sample leadership while periodically forcing the current leader out.
        let started = std::time::Instant::now();
        let mut samples = 0u32;
        let mut last_churn = std::time::Instant::now();
        while started.elapsed() < Duration::from_secs(2) {
            let leaders = handles.iter().filter(|h| h.is_leader()).count();
            assert!(
                leaders <= 1,
                "observed {} simultaneous leaders after {} samples",
                leaders,
                samples
            );
            samples += 1;

            if last_churn.elapsed() > Duration::from_millis(150) {
                if let Some(leader) = handles.iter().find(|h| h.is_leader()) {
                    leader.re_election().await.unwrap();
                    last_churn = std::time::Instant::now();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(samples > 100);

        token.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(handles.iter().all(|h| !h.is_leader()));
    }
}
