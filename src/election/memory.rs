//! In-memory coordination backend for tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use super::coordinator::{CoordinationError, Coordinator, KeyObservation};

struct Session {
    deadline: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct KeyEntry {
    session: Option<String>,
    index: u64,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    keys: HashMap<String, KeyEntry>,
    next_index: u64,
}

/// Coordinator holding sessions and keys in process memory.
///
/// Sessions expire on their TTL like the real backend; expiry releases any
/// key the session holds. `set_unreachable` makes every call fail, for
/// exercising coordination-outage behavior.
pub struct MemoryCoordinator {
    state: Mutex<State>,
    changed: Notify,
    unreachable: AtomicBool,
    releases: AtomicUsize,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            unreachable: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }

    /// Simulate the backend being unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of explicit key releases observed (session expiry not counted).
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), CoordinationError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(CoordinationError::Unreachable(
                "backend marked unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn expire_sessions(state: &mut State, changed: &Notify) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            state.sessions.remove(id);
        }
        state.next_index += 1;
        let next_index = state.next_index;
        let mut released_any = false;
        for entry in state.keys.values_mut() {
            if let Some(holder) = &entry.session {
                if expired.contains(holder) {
                    entry.session = None;
                    entry.index = next_index;
                    released_any = true;
                }
            }
        }
        if released_any {
            changed.notify_waiters();
        }
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create_session(
        &self,
        _name: &str,
        ttl: Duration,
        _checks: &[String],
    ) -> Result<String, CoordinationError> {
        self.check_reachable()?;
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap();
        Self::expire_sessions(&mut state, &self.changed);
        state.sessions.insert(
            id.clone(),
            Session {
                deadline: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn renew_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        Self::expire_sessions(&mut state, &self.changed);
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.deadline = Instant::now() + session.ttl;
                Ok(())
            }
            None => Err(CoordinationError::SessionInvalid),
        }
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(session_id);
        state.next_index += 1;
        let next_index = state.next_index;
        let mut released_any = false;
        for entry in state.keys.values_mut() {
            if entry.session.as_deref() == Some(session_id) {
                entry.session = None;
                entry.index = next_index;
                released_any = true;
            }
        }
        if released_any {
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn acquire_key(
        &self,
        key: &str,
        session_id: &str,
        _value: &str,
    ) -> Result<bool, CoordinationError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        Self::expire_sessions(&mut state, &self.changed);
        if !state.sessions.contains_key(session_id) {
            return Err(CoordinationError::SessionInvalid);
        }
        state.next_index += 1;
        let next_index = state.next_index;
        let entry = state.keys.entry(key.to_string()).or_default();
        match &entry.session {
            Some(holder) if holder != session_id => Ok(false),
            _ => {
                entry.session = Some(session_id.to_string());
                entry.index = next_index;
                self.changed.notify_waiters();
                Ok(true)
            }
        }
    }

    async fn release_key(&self, key: &str, session_id: &str) -> Result<(), CoordinationError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.next_index += 1;
        let next_index = state.next_index;
        if let Some(entry) = state.keys.get_mut(key) {
            if entry.session.as_deref() == Some(session_id) {
                entry.session = None;
                entry.index = next_index;
                self.releases.fetch_add(1, Ordering::SeqCst);
                self.changed.notify_waiters();
            }
        }
        Ok(())
    }

    async fn observe_key(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<KeyObservation, CoordinationError> {
        let deadline = Instant::now() + wait;
        loop {
            self.check_reachable()?;
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock().unwrap();
                Self::expire_sessions(&mut state, &self.changed);
                let (holder, index) = match state.keys.get(key) {
                    Some(entry) => (entry.session.clone(), entry.index),
                    None => (None, 0),
                };
                if index > last_index || Instant::now() >= deadline {
                    return Ok(KeyObservation { holder, index });
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}
