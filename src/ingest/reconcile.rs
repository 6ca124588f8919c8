//! The reconciliation pipeline keeping the catalog consistent with the blob
//! store.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::events::{ChangeEvent, ObjectAction};
use super::tags::read_tags;
use crate::blob_store::BlobStore;
use crate::catalog_store::{CatalogStore, Track};
use crate::server::metrics;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch object '{key}': {reason:#}")]
    Fetch { key: String, reason: anyhow::Error },
    #[error("catalog store operation failed: {0:#}")]
    Store(anyhow::Error),
}

/// Applies change events to the catalog store.
///
/// Both delivery paths (queued messages and direct bucket notifications)
/// converge here, so a given object change lands in the catalog once no
/// matter which path delivers it first. Deduplication is by natural key
/// (title), not content hash, matching the catalog's semantics.
pub struct Reconciler {
    catalog_store: Arc<dyn CatalogStore>,
    blob_store: Arc<dyn BlobStore>,
}

impl Reconciler {
    pub fn new(catalog_store: Arc<dyn CatalogStore>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            catalog_store,
            blob_store,
        }
    }

    /// Apply a single change event. Idempotent for both actions.
    pub async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let result = match event.action {
            ObjectAction::Put => self.apply_put(event).await,
            ObjectAction::Delete => self.apply_delete(event).await,
        };
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::record_reconcile(event.action.as_str(), outcome);
        result
    }

    async fn apply_put(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let object_path = self
            .blob_store
            .download(&event.object_key)
            .await
            .map_err(|reason| ReconcileError::Fetch {
                key: event.object_key.clone(),
                reason,
            })?;

        let track = self.track_from_object(&object_path, event).await;

        // A record that already exists under the natural key is left
        // unmodified, even when the new object carries a different version.
        match self
            .catalog_store
            .find_track_by_title(&track.title)
            .map_err(ReconcileError::Store)?
        {
            Some(existing) => {
                debug!(
                    "Track '{}' already in catalog (id {}), leaving unmodified",
                    track.title, existing.id
                );
            }
            None => {
                self.catalog_store
                    .create_track(&track)
                    .map_err(ReconcileError::Store)?;
                info!(
                    "Track '{}' added to catalog from object '{}'",
                    track.title, event.object_key
                );
                metrics::set_catalog_tracks(self.catalog_store.get_tracks_count());
            }
        }
        Ok(())
    }

    /// Build a track record from the downloaded object, falling back to the
    /// object key stem when embedded tags are missing or unreadable.
    async fn track_from_object(&self, path: &Path, event: &ChangeEvent) -> Track {
        let tags = match read_tags(path).await {
            Ok(tags) => tags,
            Err(e) => {
                debug!(
                    "Could not read tags from '{}': {:#}",
                    event.object_key, e
                );
                Default::default()
            }
        };

        let fallback_title = || {
            Path::new(&event.object_key)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| event.object_key.clone())
        };

        let now = Utc::now();
        Track {
            id: Uuid::new_v4().to_string(),
            title: tags.title.unwrap_or_else(fallback_title),
            artist: tags.artist.unwrap_or_else(|| "Unknown Artist".to_string()),
            album: tags.album,
            duration_secs: tags.duration_secs,
            source_version_id: event.version_id.clone(),
            path: event.object_key.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn apply_delete(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let removed = self
            .catalog_store
            .delete_track_by_version(&event.version_id)
            .map_err(ReconcileError::Store)?;
        if removed == 0 {
            debug!(
                "No track recorded for version '{}', nothing to delete",
                event.version_id
            );
        } else {
            info!(
                "Removed {} track(s) for deleted version '{}'",
                removed, event.version_id
            );
            metrics::set_catalog_tracks(self.catalog_store.get_tracks_count());
        }
        Ok(())
    }
}

/// Drain bucket notifications (push path) into the pipeline.
///
/// Events arrive from the webhook route over a channel; processing them here
/// rather than in the HTTP handler keeps the route fire-and-forget and lets
/// shutdown drain the listener like any other supervised task.
pub async fn run_notification_listener(
    reconciler: Arc<Reconciler>,
    mut events: mpsc::Receiver<ChangeEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = events.recv() => match received {
                Some(event) => {
                    if let Err(e) = reconciler.reconcile(&event).await {
                        error!("Failed to reconcile '{}': {}", event.object_key, e);
                    }
                }
                None => break,
            }
        }
    }
    debug!("Notification listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::SqliteCatalogStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir, TempPath};

    /// Blob store serving the same fixed bytes for every key.
    struct StaticBlobStore;

    #[async_trait]
    impl BlobStore for StaticBlobStore {
        async fn download(&self, _key: &str) -> Result<TempPath> {
            let mut file = NamedTempFile::new()?;
            file.write_all(b"not really audio")?;
            Ok(file.into_temp_path())
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Blob store whose objects are all gone.
    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn download(&self, key: &str) -> Result<TempPath> {
            anyhow::bail!("no such object: {}", key)
        }

        async fn probe(&self) -> Result<()> {
            anyhow::bail!("bucket unreachable")
        }
    }

    fn make_reconciler() -> (Reconciler, Arc<SqliteCatalogStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteCatalogStore::new(temp_dir.path().join("catalog.db")).unwrap());
        let reconciler = Reconciler::new(
            Arc::clone(&store) as Arc<dyn CatalogStore>,
            Arc::new(StaticBlobStore),
        );
        (reconciler, store, temp_dir)
    }

    fn put_event(key: &str, version: &str) -> ChangeEvent {
        ChangeEvent {
            object_key: key.to_string(),
            version_id: version.to_string(),
            action: ObjectAction::Put,
        }
    }

    fn delete_event(version: &str) -> ChangeEvent {
        ChangeEvent {
            object_key: String::new(),
            version_id: version.to_string(),
            action: ObjectAction::Delete,
        }
    }

    #[tokio::test]
    async fn test_put_creates_track_with_fallback_title() {
        let (reconciler, store, _dir) = make_reconciler();
        reconciler
            .reconcile(&put_event("albums/First Light.mp3", "v1"))
            .await
            .unwrap();

        let track = store.find_track_by_title("First Light").unwrap().unwrap();
        assert_eq!(track.source_version_id, "v1");
        assert_eq!(track.path, "albums/First Light.mp3");
        assert_eq!(track.artist, "Unknown Artist");
    }

    #[tokio::test]
    async fn test_repeated_put_is_idempotent() {
        let (reconciler, store, _dir) = make_reconciler();
        let event = put_event("albums/First Light.mp3", "v1");

        // Same event delivered twice, e.g. once via the queue and once via
        // the push notification.
        reconciler.reconcile(&event).await.unwrap();
        reconciler.reconcile(&event).await.unwrap();

        assert_eq!(store.get_tracks_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_track_is_not_refreshed_by_new_version() {
        let (reconciler, store, _dir) = make_reconciler();
        reconciler
            .reconcile(&put_event("albums/First Light.mp3", "v1"))
            .await
            .unwrap();
        reconciler
            .reconcile(&put_event("albums/First Light.mp3", "v2"))
            .await
            .unwrap();

        let track = store.find_track_by_title("First Light").unwrap().unwrap();
        assert_eq!(track.source_version_id, "v1");
        assert_eq!(store.get_tracks_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (reconciler, store, _dir) = make_reconciler();
        reconciler
            .reconcile(&put_event("albums/First Light.mp3", "v1"))
            .await
            .unwrap();
        assert_eq!(store.get_tracks_count(), 1);

        reconciler.reconcile(&delete_event("v1")).await.unwrap();
        assert_eq!(store.get_tracks_count(), 0);

        // Re-applying the delete, or deleting an unknown version, succeeds.
        reconciler.reconcile(&delete_event("v1")).await.unwrap();
        reconciler
            .reconcile(&delete_event("v-unknown"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteCatalogStore::new(temp_dir.path().join("catalog.db")).unwrap());
        let reconciler = Reconciler::new(
            Arc::clone(&store) as Arc<dyn CatalogStore>,
            Arc::new(FailingBlobStore),
        );

        let result = reconciler.reconcile(&put_event("gone.mp3", "v1")).await;
        assert!(matches!(result, Err(ReconcileError::Fetch { .. })));
        assert_eq!(store.get_tracks_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_listener_reconciles_and_drains() {
        let (reconciler, store, _dir) = make_reconciler();
        let reconciler = Arc::new(reconciler);
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let listener = tokio::spawn(run_notification_listener(
            Arc::clone(&reconciler),
            rx,
            token.clone(),
        ));

        tx.send(put_event("a.mp3", "v-a")).await.unwrap();
        tx.send(put_event("b.mp3", "v-b")).await.unwrap();
        drop(tx);

        listener.await.unwrap();
        assert_eq!(store.get_tracks_count(), 2);
    }
}
