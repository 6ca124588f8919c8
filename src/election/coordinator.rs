//! Coordination backend abstraction and the Consul HTTP implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from the coordination backend.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination backend unreachable: {0}")]
    Unreachable(String),
    #[error("session is expired or invalid")]
    SessionInvalid,
    #[error("unexpected backend response: {0}")]
    Protocol(String),
}

/// What the mutual-exclusion key currently looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyObservation {
    /// Session id of the current holder, if the key is held.
    pub holder: Option<String>,
    /// Modification index for the next blocking observation.
    pub index: u64,
}

/// Session-based mutual exclusion with TTL, as offered by Consul-style
/// coordination backends.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a session with the given TTL. `checks` are backend health-check
    /// identifiers; when any of them fails, the backend invalidates the
    /// session and releases its keys.
    async fn create_session(
        &self,
        name: &str,
        ttl: Duration,
        checks: &[String],
    ) -> Result<String, CoordinationError>;

    /// Keep a session alive. Must be called more often than the TTL.
    async fn renew_session(&self, session_id: &str) -> Result<(), CoordinationError>;

    /// Destroy a session, releasing any keys it holds.
    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError>;

    /// Try to acquire the key under the session. Returns whether the key was
    /// acquired; `false` means another session holds it.
    async fn acquire_key(
        &self,
        key: &str,
        session_id: &str,
        value: &str,
    ) -> Result<bool, CoordinationError>;

    /// Release the key if held by the session.
    async fn release_key(&self, key: &str, session_id: &str) -> Result<(), CoordinationError>;

    /// Block until the key changes past `last_index` or `wait` elapses, then
    /// report the current holder.
    async fn observe_key(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<KeyObservation, CoordinationError>;
}

/// Coordinator backed by the Consul HTTP API (sessions + KV acquire/release
/// + blocking queries).
pub struct ConsulCoordinator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvPair {
    #[serde(rename = "Session")]
    session: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

impl ConsulCoordinator {
    /// Create a coordinator client for the given Consul agent address
    /// (e.g. "http://127.0.0.1:8500").
    pub fn new(address: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: address.trim_end_matches('/').to_string(),
        }
    }

    fn transport(e: reqwest::Error) -> CoordinationError {
        CoordinationError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl Coordinator for ConsulCoordinator {
    async fn create_session(
        &self,
        name: &str,
        ttl: Duration,
        checks: &[String],
    ) -> Result<String, CoordinationError> {
        let url = format!("{}/v1/session/create", self.base_url);
        let mut body = serde_json::json!({
            "Name": name,
            "TTL": format!("{}s", ttl.as_secs()),
            "Behavior": "release",
            "LockDelay": "1s",
        });
        if !checks.is_empty() {
            body["Checks"] = serde_json::json!(checks);
        }

        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "session create returned {}",
                response.status()
            )));
        }
        let created: SessionCreated = response.json().await.map_err(Self::transport)?;
        debug!("Created coordination session {}", created.id);
        Ok(created.id)
    }

    async fn renew_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        let url = format!("{}/v1/session/renew/{}", self.base_url, session_id);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(Self::transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(CoordinationError::SessionInvalid)
        } else {
            Err(CoordinationError::Protocol(format!(
                "session renew returned {}",
                status
            )))
        }
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        let url = format!("{}/v1/session/destroy/{}", self.base_url, session_id);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "session destroy returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn acquire_key(
        &self,
        key: &str,
        session_id: &str,
        value: &str,
    ) -> Result<bool, CoordinationError> {
        let url = format!(
            "{}/v1/kv/{}?acquire={}",
            self.base_url, key, session_id
        );
        let response = self
            .client
            .put(&url)
            .body(value.to_string())
            .send()
            .await
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "key acquire returned {}",
                response.status()
            )));
        }
        response.json::<bool>().await.map_err(Self::transport)
    }

    async fn release_key(&self, key: &str, session_id: &str) -> Result<(), CoordinationError> {
        let url = format!(
            "{}/v1/kv/{}?release={}",
            self.base_url, key, session_id
        );
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "key release returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn observe_key(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<KeyObservation, CoordinationError> {
        let url = format!(
            "{}/v1/kv/{}?index={}&wait={}s",
            self.base_url,
            key,
            last_index,
            wait.as_secs().max(1)
        );
        let response = self
            .client
            .get(&url)
            .timeout(wait + Duration::from_secs(5))
            .send()
            .await
            .map_err(Self::transport)?;

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(last_index);

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            Ok(KeyObservation {
                holder: None,
                index,
            })
        } else if status.is_success() {
            let pairs: Vec<KvPair> = response.json().await.map_err(Self::transport)?;
            let observation = pairs
                .into_iter()
                .next()
                .map(|pair| KeyObservation {
                    holder: pair.session,
                    index: pair.modify_index.max(index),
                })
                .unwrap_or(KeyObservation {
                    holder: None,
                    index,
                });
            Ok(observation)
        } else {
            Err(CoordinationError::Protocol(format!(
                "key observation returned {}",
                status
            )))
        }
    }
}
