//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire. Track
//! bytes are the one exception: a [`Outcome::TrackFollows`] reply is followed
//! by a raw blob frame carrying the file contents.

use serde::{Deserialize, Serialize};
use unison_core::{Action, RoomCode, Snapshot, TrackId};

/// Correlates a reply with its request
pub type RequestId = u64;

/// Request kinds a client may send after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Full room state and track index
    Snapshot,
    /// Server wall clock
    Time,
    Heartbeat,
    /// Assert local possession of the head track
    ReportPossession { track: TrackId },
    /// Stream a track's bytes
    FetchTrack { track: TrackId },
    /// Guarded mutation against the caller's last-seen version
    Control {
        expected_version: u32,
        action: Action,
    },
}

/// Why a request failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// Version mismatch; the caller must resynchronise before retrying
    Conflict { snapshot: Box<Snapshot> },
    NotFound { what: String },
    BadRequest { reason: String },
    /// The server could not complete an otherwise valid request
    Internal { reason: String },
}

/// Server answer to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Snapshot { snapshot: Box<Snapshot> },
    Time { now: f64 },
    /// A raw blob frame of `len` bytes follows this reply
    TrackFollows { track: TrackId, len: u64 },
    Failed { failure: Failure },
}

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// First message on every connection
    Hello {
        room: RoomCode,
        client: String,
        /// Make this connection the participant's push subscription
        subscribe: bool,
    },

    /// Handshake accepted
    Welcome { snapshot: Box<Snapshot> },

    /// Handshake refused
    Rejected { reason: String },

    Request { id: RequestId, op: Op },

    Reply { id: RequestId, outcome: Outcome },

    /// State pushed after every accepted change
    Snapshot { snapshot: Box<Snapshot> },
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
