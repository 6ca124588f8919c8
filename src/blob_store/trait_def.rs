//! BlobStore trait definition.

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempPath;

/// Trait for the blob storage backend holding the source media objects.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download an object to a temporary file. The file is removed when the
    /// returned path is dropped.
    async fn download(&self, key: &str) -> Result<TempPath>;

    /// Cheap connectivity check used by the blob-store health probe.
    async fn probe(&self) -> Result<()>;
}
