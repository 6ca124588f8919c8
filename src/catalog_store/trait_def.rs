//! CatalogStore trait definition.

use super::models::Track;
use anyhow::Result;

/// Trait for catalog storage backends.
///
/// Only the operations the reconciliation pipeline and the health prober
/// need; the wider CRUD surface lives with the API layer, not here.
pub trait CatalogStore: Send + Sync {
    /// Look up a track by its natural key (title).
    fn find_track_by_title(&self, title: &str) -> Result<Option<Track>>;

    /// Insert a new track record.
    fn create_track(&self, track: &Track) -> Result<()>;

    /// Delete any track created from the given source version.
    ///
    /// Returns the number of rows removed; 0 when nothing matches, which is
    /// not an error.
    fn delete_track_by_version(&self, version_id: &str) -> Result<usize>;

    /// Number of tracks in the catalog (for metrics and stats).
    fn get_tracks_count(&self) -> usize;

    /// Cheap connectivity check used by the database health probe.
    fn ping(&self) -> Result<()>;
}
