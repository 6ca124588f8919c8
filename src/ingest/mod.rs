//! Ingestion of blob-store change events into the catalog.
//!
//! Two delivery paths feed the same reconciliation pipeline: messages drained
//! from the broker by a bounded worker pool, and bucket notifications pushed
//! directly over HTTP. Both converge on the pipeline's idempotency contract.

mod consumer;
mod events;
mod reconcile;
mod tags;

pub use consumer::{pump_deliveries, EnvelopeHandler, ItemHandler, WorkItem, WorkerPool};
pub use events::{decode_envelope, ChangeEvent, DecodeError, ObjectAction};
pub use reconcile::{run_notification_listener, ReconcileError, Reconciler};
pub use tags::{read_tags, AudioTags};
