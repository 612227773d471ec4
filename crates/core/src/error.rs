//! Error types for Unison Core

use thiserror::Error;

use crate::models::Snapshot;

#[derive(Error, Debug)]
pub enum Error {
    /// The caller's version is stale. Carries the authoritative state so the
    /// caller can re-derive its intent.
    #[error("Version conflict: room is at version {}", current.room_state.version)]
    Conflict { current: Box<Snapshot> },

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("Track {got} is not the current head (expected {expected:?})")]
    NotHead {
        expected: Option<String>,
        got: String,
    },

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// The local blob store is unusable. Never retried.
    #[error("Local storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that are terminal for the request (unknown room/track)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RoomNotFound(_) | Error::TrackNotFound(_) | Error::UnknownParticipant(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
