//! AMQP broker connectivity.

use anyhow::{Context, Result};
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, Consumer};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry an async connect operation indefinitely at a fixed delay.
///
/// The dependency is required at boot, so failures block startup rather than
/// crash it. Returns `None` when the token is cancelled before a connection
/// is made.
pub async fn retry_until_connected<T, F, Fut>(
    mut connect: F,
    delay: Duration,
    token: &CancellationToken,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        tokio::select! {
            _ = token.cancelled() => return None,
            result = connect() => match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Connected after {} attempts", attempt);
                    }
                    return Some(value);
                }
                Err(e) => warn!("Connection attempt {} failed: {:#}", attempt, e),
            }
        }
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Holds the broker transport and hands out delivery streams.
///
/// Reconnecting after an established connection drops is not handled here;
/// when the connection dies the delivery stream ends and the consumer loop
/// stops.
pub struct BrokerConnector {
    connection: Connection,
    queue: String,
}

impl BrokerConnector {
    /// Establish the AMQP connection, retrying indefinitely at `retry_delay`.
    /// Blocks until connected; returns `None` if the token is cancelled first.
    pub async fn connect(
        url: &str,
        queue: &str,
        retry_delay: Duration,
        token: &CancellationToken,
    ) -> Option<Self> {
        info!("Connecting to message broker, queue '{}'...", queue);
        let connection = retry_until_connected(
            || async {
                Connection::connect(url, ConnectionProperties::default())
                    .await
                    .context("AMQP connection failed")
            },
            retry_delay,
            token,
        )
        .await?;
        info!("Connected to message broker");
        Some(Self {
            connection,
            queue: queue.to_string(),
        })
    }

    /// Whether the underlying connection is still open.
    pub fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    /// Declare the queue and start consuming deliveries from it.
    ///
    /// Deliveries are auto-acknowledged: a message that fails to decode or
    /// process is dropped, not redelivered.
    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue '{}'", self.queue))?;
        channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to start consumer on queue '{}'", self.queue))
    }

    /// Close the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .context("Failed to close AMQP connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_eventually_connects() {
        // Unreachable for three cycles, then a usable handle.
        let attempts = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = Arc::clone(&attempts);

        let handle = retry_until_connected(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(42u32)
                }
            },
            Duration::from_millis(10),
            &token,
        )
        .await;

        assert_eq!(handle, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_aborts_on_cancellation() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let handle: Option<u32> = retry_until_connected(
            || async { anyhow::bail!("connection refused") },
            Duration::from_millis(10),
            &token,
        )
        .await;

        assert_eq!(handle, None);
    }
}
