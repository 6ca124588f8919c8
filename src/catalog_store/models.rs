//! Catalog record models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A track record derived from an object observed in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    /// Natural key used to deduplicate repeated sightings of the same content.
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
    /// Version identifier of the blob-store object this record was created from.
    pub source_version_id: String,
    /// Object key within the media bucket.
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
