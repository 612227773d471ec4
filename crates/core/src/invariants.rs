//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible room states during development.
//! These checks are compiled out in release builds.

use crate::models::{PlayState, RoomState, EVENT_MODULO};

/// Validate that a room state about to be committed is internally consistent
pub fn assert_room_invariants(state: &RoomState) {
    debug_assert!(
        state.version < EVENT_MODULO,
        "Room version {} escaped the version space",
        state.version
    );

    // Possession only ever refers to the current head
    let head = state.head();
    for (name, client) in &state.clients {
        debug_assert!(
            client.acknowledged_head.is_none() || client.acknowledged_head.as_ref() == head,
            "Participant {} acknowledged {:?} but head is {:?}",
            name,
            client.acknowledged_head,
            head
        );
    }

    let value = match state.play_state {
        PlayState::Paused { position } => position,
        PlayState::OnBarrier { resume_position } => resume_position,
        PlayState::Armed {
            wall_time_at_song_start,
        }
        | PlayState::Playing {
            wall_time_at_song_start,
        } => wall_time_at_song_start,
    };
    debug_assert!(
        value.is_finite(),
        "Play state {:?} carries a non-finite time",
        state.play_state
    );
}

/// Validate that the queue holds no duplicate track ids
pub fn assert_queue_invariants(queue: &[String]) {
    let mut seen = std::collections::HashSet::new();
    for id in queue {
        debug_assert!(seen.insert(id), "Track {} queued twice", id);
    }
}
