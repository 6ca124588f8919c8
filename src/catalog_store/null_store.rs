//! No-op catalog store used by tests and wiring that does not need persistence.

use super::models::Track;
use super::trait_def::CatalogStore;
use anyhow::Result;

/// Catalog store that stores nothing and finds nothing.
pub struct NullCatalogStore;

impl CatalogStore for NullCatalogStore {
    fn find_track_by_title(&self, _title: &str) -> Result<Option<Track>> {
        Ok(None)
    }

    fn create_track(&self, _track: &Track) -> Result<()> {
        Ok(())
    }

    fn delete_track_by_version(&self, _version_id: &str) -> Result<usize> {
        Ok(0)
    }

    fn get_tracks_count(&self) -> usize {
        0
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}
