//! Network error types

use std::io;

use unison_core::Snapshot;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    /// The server refused a guarded mutation; carries the state it holds
    #[error("Out of sync: room is at version {}", .0.room_state.version)]
    Conflict(Box<Snapshot>),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient failure fetching track bytes
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Core(#[from] unison_core::Error),
}
