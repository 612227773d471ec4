//! Guarded room mutations
//!
//! Every control action is applied to a working copy of the room state under
//! the store's version check. A head change always clears possession reports
//! and sends the room back to the barrier.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::barrier::ARM_LEAD_SECS;
use crate::error::{Error, Result};
use crate::models::{PlayState, RoomState, TrackId, TrackIndex};

/// A user-initiated change to the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Play,
    Pause,
    Seek { position: f64 },
    Next,
    Prev,
    /// Move a track to the next-up slot
    Nudge { track: TrackId },
    /// Randomise everything after the head
    Shuffle,
    /// Restore the index's natural order, keeping the head
    Reset,
}

impl Action {
    /// Apply this action to `state` at server time `now`.
    ///
    /// On error `state` may be partially modified; callers apply actions to a
    /// working copy and discard it on failure.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        state: &mut RoomState,
        index: &TrackIndex,
        now: f64,
        rng: &mut R,
    ) -> Result<()> {
        let previous_head = state.head().cloned();

        match self {
            Action::Play => {
                if let PlayState::Paused { position } = state.play_state {
                    state.play_state = PlayState::OnBarrier {
                        resume_position: position,
                    };
                }
            }
            Action::Pause => {
                let position = state.play_state.position_at(now);
                state.play_state = PlayState::paused_at(position);
            }
            Action::Seek { position } => {
                let position = if position.is_finite() {
                    position.max(0.0)
                } else {
                    0.0
                };
                state.play_state = match state.play_state {
                    PlayState::Paused { .. } => PlayState::paused_at(position),
                    PlayState::OnBarrier { .. } => PlayState::OnBarrier {
                        resume_position: position,
                    },
                    PlayState::Armed { .. } | PlayState::Playing { .. } => PlayState::Armed {
                        wall_time_at_song_start: now + ARM_LEAD_SECS - position,
                    },
                };
            }
            Action::Next => {
                if !state.queue.is_empty() {
                    state.queue.rotate_left(1);
                }
            }
            Action::Prev => {
                if !state.queue.is_empty() {
                    state.queue.rotate_right(1);
                }
            }
            Action::Nudge { track } => {
                let idx = state
                    .queue
                    .iter()
                    .position(|t| t == track)
                    .ok_or_else(|| Error::TrackNotFound(track.clone()))?;
                if idx > 1 {
                    let moved = state.queue.remove(idx);
                    state.queue.insert(1, moved);
                }
            }
            Action::Shuffle => {
                if state.queue.len() > 2 {
                    state.queue[1..].shuffle(rng);
                }
            }
            Action::Reset => {
                state.queue = index.ids_starting_at(previous_head.as_deref());
            }
        }

        if state.head() != previous_head.as_ref() {
            state.clear_acknowledgments();
            state.play_state = PlayState::OnBarrier {
                resume_position: 0.0,
            };
        }

        Ok(())
    }
}
