//! Durable room files
//!
//! One JSON file per room. Writes go to a temporary file that is fsynced and
//! then renamed over the target, so a crash leaves either the previous or the
//! new version on disk, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::models::{RoomCode, RoomState};

const ROOM_FILE_EXT: &str = "json";

/// Directory of persisted room states
pub struct RoomFiles {
    dir: PathBuf,
}

impl RoomFiles {
    /// Open (creating if needed) the state directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, code: &RoomCode) -> PathBuf {
        self.dir.join(format!("{}.{}", code, ROOM_FILE_EXT))
    }

    /// Atomically replace the stored state of a room
    pub fn save(&self, code: &RoomCode, state: &RoomState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path_for(code), &bytes)
            .map_err(|e| Error::Persist(format!("room {}: {}", code, e)))
    }

    /// Load every persisted room. A file that cannot be parsed is fatal:
    /// silently discarding a room would lose accepted mutations.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn load_all(&self) -> Result<Vec<(RoomCode, RoomState)>> {
        let mut rooms = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ROOM_FILE_EXT) {
                continue;
            }
            let Some(code) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "Skipping room file with unreadable name");
                continue;
            };

            let text = fs::read_to_string(&path)?;
            let state: RoomState = serde_json::from_str(&text).map_err(|e| {
                Error::Persist(format!("corrupted room file {}: {}", path.display(), e))
            })?;
            debug!(room = code, version = state.version, "Loaded room");
            rooms.push((RoomCode::new(code), state));
        }
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rooms)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", ROOM_FILE_EXT));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = RoomFiles::open(dir.path()).unwrap();
        let code = RoomCode::new("abc123");
        let mut state = RoomState::new(vec!["t1".into(), "t2".into()]);
        state.version = 9;

        files.save(&code, &state).unwrap();
        let loaded = files.load_all().unwrap();

        assert_eq!(loaded, vec![(code, state)]);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = RoomFiles::open(dir.path()).unwrap();
        files
            .save(&RoomCode::new("r"), &RoomState::new(vec![]))
            .unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["r.json".to_string()]);
    }

    #[test]
    fn test_corrupted_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
        let files = RoomFiles::open(dir.path()).unwrap();
        assert!(matches!(files.load_all(), Err(Error::Persist(_))));
    }
}
