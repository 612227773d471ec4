//! Full room snapshot - the unit of replication from server to clients

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::room::{RoomCode, RoomState};
use super::track::TrackIndex;

/// Room state plus the reference track index, as pushed to every client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub room: RoomCode,
    pub room_state: RoomState,
    pub index: Arc<TrackIndex>,
    /// Server wall clock when the snapshot was taken
    pub server_now: f64,
}

impl Snapshot {
    pub fn version(&self) -> u32 {
        self.room_state.version
    }
}
