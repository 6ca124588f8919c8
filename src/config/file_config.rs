//! TOML file configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub logging_level: Option<String>,
    pub broker: Option<BrokerFileConfig>,
    pub coordination: Option<CoordinationFileConfig>,
    pub blob_store: Option<BlobStoreFileConfig>,
    pub health: Option<HealthFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerFileConfig {
    pub url: Option<String>,
    pub queue: Option<String>,
    pub workers: Option<usize>,
    pub connect_retry_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinationFileConfig {
    pub address: Option<String>,
    pub key: Option<String>,
    pub node_name: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub retry_secs: Option<u64>,
    pub checks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlobStoreFileConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthFileConfig {
    pub db_interval_secs: Option<u64>,
    pub broker_interval_secs: Option<u64>,
    pub blob_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }
}
