//! Rendezvous barrier
//!
//! Playback of a new head track only starts once every present participant
//! has reported holding it locally. The check is a pure predicate over room
//! state; the store calls [`arm_if_satisfied`] after possession reports,
//! push disconnects, evictions and mutations that enter `OnBarrier`.

use crate::models::{PlayState, RoomState};

/// Lead time between arming and the scheduled start, so that every connected
/// client receives the push before the first frame is due
pub const ARM_LEAD_SECS: f64 = 1.2;

/// True when nobody present is still missing the head track.
///
/// Vacuously true with no present participants, whatever stale possession
/// markers remain. An empty queue with someone present is never satisfied.
pub fn satisfied(state: &RoomState, now: f64) -> bool {
    let mut present = state.present_participants(now).peekable();
    if present.peek().is_none() {
        return true;
    }
    let Some(head) = state.head() else {
        return false;
    };
    present.all(|(_, c)| c.acknowledged_head.as_ref() == Some(head))
}

/// Transition `OnBarrier` to `Armed` when the barrier is satisfied.
///
/// The anchor is placed [`ARM_LEAD_SECS`] in the future, minus the position
/// playback should resume from. Returns true if the state changed.
pub fn arm_if_satisfied(state: &mut RoomState, now: f64) -> bool {
    let PlayState::OnBarrier { resume_position } = state.play_state else {
        return false;
    };
    if state.head().is_none() || !satisfied(state, now) {
        return false;
    }
    state.play_state = PlayState::Armed {
        wall_time_at_song_start: now + ARM_LEAD_SECS - resume_position,
    };
    true
}
