//! Local track blob store
//!
//! Durable SQLite store of track bytes keyed by track id. Errors from this
//! store are surfaced as [`Error::Storage`](crate::Error::Storage) and mean
//! the cache itself is unusable.

mod migrations;
mod retention;

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::TrackId;

pub use retention::{eviction_candidates, protected_set, RecentTracks, RECENT_KEEP};

/// Handle to the blob store
pub struct BlobStore {
    conn: Connection,
}

impl BlobStore {
    /// Open or create the store at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)
    }

    pub fn get(&self, track: &TrackId) -> Result<Option<Vec<u8>>> {
        let bytes = self
            .conn
            .query_row(
                "SELECT bytes FROM tracks WHERE track_id = ?1",
                params![track],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    pub fn contains(&self, track: &TrackId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tracks WHERE track_id = ?1",
                params![track],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Store (or replace) a track's bytes
    pub fn put(&self, track: &TrackId, bytes: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tracks (track_id, bytes, size, stored_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(track_id) DO UPDATE SET
                bytes = excluded.bytes,
                size = excluded.size,
                stored_at = excluded.stored_at",
            params![track, bytes, bytes.len() as i64, Utc::now().to_rfc3339()],
        )?;
        debug!(track = %track, size = bytes.len(), "Cached track");
        Ok(())
    }

    /// Remove a track. Returns true if it was present.
    pub fn delete(&self, track: &TrackId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM tracks WHERE track_id = ?1", params![track])?;
        Ok(removed > 0)
    }

    /// Ids of every cached track, oldest first
    pub fn keys(&self) -> Result<Vec<TrackId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT track_id FROM tracks ORDER BY stored_at, track_id")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<TrackId>, _>>()?;
        Ok(keys)
    }

    /// Total bytes held
    pub fn total_size(&self) -> Result<u64> {
        let size: i64 =
            self.conn
                .query_row("SELECT COALESCE(SUM(size), 0) FROM tracks", [], |row| {
                    row.get(0)
                })?;
        Ok(size.max(0) as u64)
    }
}
