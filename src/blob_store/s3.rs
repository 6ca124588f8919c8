//! S3-compatible blob store client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::Client;
use std::io::Write;
use tempfile::{NamedTempFile, TempPath};

use super::trait_def::BlobStore;
use crate::config::BlobStoreSettings;

/// Blob store backed by an S3-compatible object storage service
/// (MinIO, AWS S3, ...).
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(settings: &BlobStoreSettings) -> Self {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "static",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn download(&self, key: &str) -> Result<TempPath> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to fetch object '{}'", key))?;

        let bytes = object
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of object '{}'", key))?
            .into_bytes();

        let mut file = NamedTempFile::new().context("Failed to create temporary file")?;
        file.write_all(&bytes)
            .context("Failed to write object to temporary file")?;
        Ok(file.into_temp_path())
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .with_context(|| format!("Failed to list bucket '{}'", self.bucket))?;
        Ok(())
    }
}
