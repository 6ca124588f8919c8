//! Bounded worker pool draining broker deliveries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::events::{decode_envelope, DecodeError};
use super::reconcile::Reconciler;

/// One broker delivery, owned by a single pool worker while processed.
#[derive(Debug)]
pub struct WorkItem {
    pub body: Vec<u8>,
}

/// Handler invoked by pool workers for each delivery.
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    async fn handle(&self, item: WorkItem);
}

/// Decodes notification envelopes and runs the reconciliation pipeline.
pub struct EnvelopeHandler {
    reconciler: Arc<Reconciler>,
}

impl EnvelopeHandler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl ItemHandler for EnvelopeHandler {
    async fn handle(&self, item: WorkItem) {
        let events = match decode_envelope(&item.body) {
            Ok(events) => events,
            Err(DecodeError::UnsupportedEvent(name)) => {
                debug!("Event '{}' not processed", name);
                return;
            }
            Err(e) => {
                // At-most-once on error: the message is gone, not redelivered.
                error!("Dropping undecodable message: {}", e);
                return;
            }
        };

        for event in &events {
            if let Err(e) = self.reconciler.reconcile(event).await {
                error!("Failed to reconcile '{}': {}", event.object_key, e);
            }
        }
    }
}

/// Fixed-size pool of concurrent delivery handlers.
///
/// Shutdown is cooperative: cancelling the token stops intake, every
/// in-flight handler runs to completion, then `start_processing` returns.
/// A handler that errors or panics only loses its own item.
pub struct WorkerPool {
    handler: Arc<dyn ItemHandler>,
    num_workers: usize,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn ItemHandler>, num_workers: usize) -> Self {
        Self {
            handler,
            num_workers: num_workers.max(1),
        }
    }

    /// Pull items until the channel closes or the token is cancelled, keeping
    /// at most `num_workers` handlers in flight.
    pub async fn start_processing(
        &self,
        token: CancellationToken,
        mut items: mpsc::Receiver<WorkItem>,
    ) {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.num_workers));
        info!("Worker pool started with {} workers", self.num_workers);

        loop {
            // Hold a permit before pulling so no delivery waits unowned.
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.expect("worker semaphore closed")
                }
            };

            let item = tokio::select! {
                _ = token.cancelled() => break,
                received = items.recv() => match received {
                    Some(item) => item,
                    None => {
                        debug!("Delivery stream ended");
                        break;
                    }
                }
            };

            let handler = Arc::clone(&self.handler);
            tracker.spawn(async move {
                handler.handle(item).await;
                drop(permit);
            });
        }

        tracker.close();
        tracker.wait().await;
        info!("Worker pool drained");
    }
}

/// Forward broker deliveries into the pool's intake channel.
///
/// Ends when the consumer stream ends (for instance because the broker
/// connection dropped) or the token is cancelled; there is no reconnect.
pub async fn pump_deliveries(
    mut consumer: lapin::Consumer,
    tx: mpsc::Sender<WorkItem>,
    token: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("Broker delivery error: {}", e);
                    continue;
                }
                None => {
                    warn!("Broker delivery stream closed; intake stops until restart");
                    break;
                }
            },
        };
        if tx.send(WorkItem {
            body: delivery.data,
        })
        .await
        .is_err()
        {
            break;
        }
    }
    debug!("Delivery pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowHandler {
        started: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl ItemHandler for SlowHandler {
        async fn handle(&self, _item: WorkItem) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn item(n: usize) -> WorkItem {
        WorkItem {
            body: format!("item-{}", n).into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_pool_processes_everything_when_channel_closes() {
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            Arc::new(SlowHandler {
                started: Arc::clone(&started),
                completed: Arc::clone(&completed),
                delay: Duration::from_millis(10),
            }),
            3,
        );

        let (tx, rx) = mpsc::channel(16);
        for n in 0..10 {
            tx.send(item(n)).await.unwrap();
        }
        drop(tx);

        pool.start_processing(CancellationToken::new(), rx).await;
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_and_pulls_nothing_new() {
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(WorkerPool::new(
            Arc::new(SlowHandler {
                started: Arc::clone(&started),
                completed: Arc::clone(&completed),
                delay: Duration::from_millis(200),
            }),
            4,
        ));

        let (tx, rx) = mpsc::channel(16);
        // More items than workers: four start, the rest stay queued.
        for n in 0..8 {
            tx.send(item(n)).await.unwrap();
        }

        let token = CancellationToken::new();
        let pool_task = {
            let pool = Arc::clone(&pool);
            let token = token.clone();
            tokio::spawn(async move { pool.start_processing(token, rx).await })
        };

        // Wait for the pool to fill, then cancel mid-flight.
        while started.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        pool_task.await.unwrap();

        // All four in-flight items finished; no new ones were pulled.
        assert_eq!(completed.load(Ordering::SeqCst), 4);
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    struct PanickyHandler {
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ItemHandler for PanickyHandler {
        async fn handle(&self, item: WorkItem) {
            if item.body == b"boom" {
                panic!("handler exploded");
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_kill_the_pool() {
        let completed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            Arc::new(PanickyHandler {
                completed: Arc::clone(&completed),
            }),
            2,
        );

        let (tx, rx) = mpsc::channel(16);
        tx.send(item(1)).await.unwrap();
        tx.send(WorkItem {
            body: b"boom".to_vec(),
        })
        .await
        .unwrap();
        tx.send(item(2)).await.unwrap();
        drop(tx);

        pool.start_processing(CancellationToken::new(), rx).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_envelope_handler_drops_undecodable_items() {
        use crate::catalog_store::{CatalogStore, SqliteCatalogStore};
        use crate::ingest::Reconciler;

        struct EmptyBlobStore;

        #[async_trait]
        impl crate::blob_store::BlobStore for EmptyBlobStore {
            async fn download(&self, _key: &str) -> anyhow::Result<tempfile::TempPath> {
                let file = tempfile::NamedTempFile::new()?;
                Ok(file.into_temp_path())
            }

            async fn probe(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let temp_dir = tempfile::TempDir::new().unwrap();
        let store =
            Arc::new(SqliteCatalogStore::new(temp_dir.path().join("catalog.db")).unwrap());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store) as Arc<dyn CatalogStore>,
            Arc::new(EmptyBlobStore),
        ));
        let handler = EnvelopeHandler::new(reconciler);

        // Garbage neither crashes nor creates records.
        handler
            .handle(WorkItem {
                body: b"garbage".to_vec(),
            })
            .await;
        assert_eq!(store.get_tracks_count(), 0);

        let valid = r#"{
            "EventName": "s3:ObjectCreated:Put",
            "Records": [{"s3": {"object": {"key": "song.mp3", "versionId": "v1"}}}]
        }"#;
        handler
            .handle(WorkItem {
                body: valid.as_bytes().to_vec(),
            })
            .await;
        assert_eq!(store.get_tracks_count(), 1);
    }
}
