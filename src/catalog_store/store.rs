//! SQLite-backed catalog store implementation.

use super::models::Track;
use super::schema;
use super::trait_def::CatalogStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// SQLite-backed catalog store.
///
/// Write volume is low (one insert per newly observed object), so a single
/// connection behind a mutex is enough; the store's own locking is the only
/// serialization the pipeline relies on.
#[derive(Clone)]
pub struct SqliteCatalogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalogStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if !db_path.exists() {
            info!("Creating new catalog database at {:?}", db_path);
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open catalog database at {:?}", db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        schema::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn track_from_row(row: &Row) -> rusqlite::Result<Track> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Track {
        id: row.get("id")?,
        title: row.get("title")?,
        artist: row.get("artist")?,
        album: row.get("album")?,
        duration_secs: row.get("duration_secs")?,
        source_version_id: row.get("source_version_id")?,
        path: row.get("path")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl CatalogStore for SqliteCatalogStore {
    fn find_track_by_title(&self, title: &str) -> Result<Option<Track>> {
        let conn = self.conn.lock().unwrap();
        let track = conn
            .query_row(
                "SELECT id, title, artist, album, duration_secs, source_version_id, path, created_at, updated_at
                 FROM tracks WHERE title = ?1 LIMIT 1",
                params![title],
                track_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up track by title '{}'", title))?;
        Ok(track)
    }

    fn create_track(&self, track: &Track) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tracks (id, title, artist, album, duration_secs, source_version_id, path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                track.id,
                track.title,
                track.artist,
                track.album,
                track.duration_secs,
                track.source_version_id,
                track.path,
                track.created_at.to_rfc3339(),
                track.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to insert track '{}'", track.title))?;
        Ok(())
    }

    fn delete_track_by_version(&self, version_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM tracks WHERE source_version_id = ?1",
                params![version_id],
            )
            .with_context(|| format!("Failed to delete tracks for version '{}'", version_id))?;
        Ok(removed)
    }

    fn get_tracks_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .context("Catalog database ping failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn make_store() -> (SqliteCatalogStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteCatalogStore::new(temp_dir.path().join("catalog.db")).unwrap();
        (store, temp_dir)
    }

    fn make_track(title: &str, version: &str) -> Track {
        let now = Utc::now();
        Track {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            artist: "Test Artist".to_string(),
            album: Some("Test Album".to_string()),
            duration_secs: Some(215.3),
            source_version_id: version.to_string(),
            path: format!("media/{}.mp3", title),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_create_and_find_by_title() {
        let (store, _dir) = make_store();
        let track = make_track("One More Song", "v1");
        store.create_track(&track).unwrap();

        let found = store.find_track_by_title("One More Song").unwrap().unwrap();
        assert_eq!(found.id, track.id);
        assert_eq!(found.source_version_id, "v1");
        assert_eq!(found.artist, "Test Artist");

        assert!(store.find_track_by_title("Missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_by_version() {
        let (store, _dir) = make_store();
        store.create_track(&make_track("A", "v-a")).unwrap();
        store.create_track(&make_track("B", "v-b")).unwrap();

        assert_eq!(store.delete_track_by_version("v-a").unwrap(), 1);
        assert_eq!(store.get_tracks_count(), 1);

        // Deleting an unknown or already-removed version is not an error.
        assert_eq!(store.delete_track_by_version("v-a").unwrap(), 0);
        assert_eq!(store.delete_track_by_version("v-unknown").unwrap(), 0);
    }

    #[test]
    fn test_ping_and_count() {
        let (store, _dir) = make_store();
        store.ping().unwrap();
        assert_eq!(store.get_tracks_count(), 0);
        store.create_track(&make_track("A", "v-a")).unwrap();
        assert_eq!(store.get_tracks_count(), 1);
    }
}
