//! Playback Convergence Controller
//!
//! Decides, from the room's play state and the estimated server clock, what
//! the local player should do to track the agreed position. The controller
//! is a pure decision step over a [`Player`]; scheduling of re-checks is
//! owned by the caller, which must replace any pending re-check with the one
//! returned here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{PlayState, TrackEntry, TrackId};

/// Errors above this are corrected with a hard seek
pub const JUMP_THRESHOLD: f64 = 0.030;

/// Errors at or below this need no correction
pub const CLOSE_ENOUGH: f64 = 0.008;

/// Rate offset applied while closing a small gap
pub const RATE_NUDGE: f64 = 0.01;

/// Re-check cadence once in sync
pub const STEADY_RECHECK: Duration = Duration::from_secs(10);

/// Retry delay while the clock estimate is unavailable
pub const ESTIMATE_RETRY: Duration = Duration::from_millis(500);

/// Decoded-enough track handed to the player
#[derive(Debug, Clone)]
pub struct PlayableTrack {
    pub track_id: TrackId,
    pub bytes: Arc<[u8]>,
    /// Length in seconds when known
    pub duration: Option<f64>,
}

impl PlayableTrack {
    /// Pair fetched bytes with the index entry describing them. A zero
    /// duration in the index means unknown.
    pub fn new(track_id: TrackId, bytes: Arc<[u8]>, entry: Option<&TrackEntry>) -> Self {
        Self {
            track_id,
            bytes,
            duration: entry.map(|e| e.duration).filter(|d| *d > 0.0),
        }
    }
}

/// Local audio output as seen by the controller
pub trait Player: Send {
    /// Track currently loaded, if any
    fn loaded(&self) -> Option<&TrackId>;
    /// Replace the loaded track; the player is left paused at zero
    fn load(&mut self, track: PlayableTrack);
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn is_playing(&self) -> bool;
    fn is_ended(&self) -> bool {
        match self.duration() {
            Some(duration) => self.position() >= duration,
            None => false,
        }
    }
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    fn set_rate(&mut self, rate: f64);
}

/// What the controller did on one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Waiting on the barrier: paused, position untouched
    Hold,
    /// Paused at the stored position
    Snap { position: f64 },
    /// Start anchor still in the future: paused at zero
    AwaitStart { remaining: f64 },
    /// No clock estimate yet
    NoEstimate,
    /// Hard seek to the target
    Jump { target: f64 },
    /// Within tolerance
    InSync,
    /// Closing a small gap by playing slightly fast or slow
    Nudge { rate: f64 },
}

/// Outcome of a convergence pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub correction: Correction,
    /// When to run again; `None` means wait for the next state push
    pub recheck: Option<Duration>,
}

impl Verdict {
    fn settle(correction: Correction) -> Self {
        Self {
            correction,
            recheck: None,
        }
    }

    fn after(correction: Correction, secs: f64) -> Self {
        Self {
            correction,
            recheck: Some(Duration::from_secs_f64(secs.max(0.0))),
        }
    }
}

/// Thresholds for steering the local player
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceController {
    pub jump_threshold: f64,
    pub close_enough: f64,
    pub rate_nudge: f64,
}

impl Default for ConvergenceController {
    fn default() -> Self {
        Self {
            jump_threshold: JUMP_THRESHOLD,
            close_enough: CLOSE_ENOUGH,
            rate_nudge: RATE_NUDGE,
        }
    }
}

impl ConvergenceController {
    /// Run one convergence pass. Never fails: a missing clock estimate
    /// yields a short retry instead of a guess.
    pub fn converge(
        &self,
        player: &mut dyn Player,
        play_state: &PlayState,
        server_now: Option<f64>,
    ) -> Verdict {
        match *play_state {
            PlayState::OnBarrier { .. } => {
                player.pause();
                Verdict::settle(Correction::Hold)
            }
            PlayState::Paused { position } => {
                player.pause();
                player.set_rate(1.0);
                player.seek(position);
                Verdict::settle(Correction::Snap { position })
            }
            PlayState::Armed {
                wall_time_at_song_start,
            }
            | PlayState::Playing {
                wall_time_at_song_start,
            } => {
                let Some(now) = server_now else {
                    return Verdict {
                        correction: Correction::NoEstimate,
                        recheck: Some(ESTIMATE_RETRY),
                    };
                };
                self.track(player, now - wall_time_at_song_start)
            }
        }
    }

    fn track(&self, player: &mut dyn Player, target: f64) -> Verdict {
        if target < 0.0 {
            player.pause();
            player.set_rate(1.0);
            if player.position() != 0.0 {
                player.seek(0.0);
            }
            return Verdict::after(Correction::AwaitStart { remaining: -target }, -target);
        }

        let delta = target - player.position();

        if delta.abs() > self.jump_threshold {
            player.seek(target);
            player.set_rate(1.0);
            player.play();
            return Verdict::after(Correction::Jump { target }, STEADY_RECHECK.as_secs_f64());
        }

        if delta.abs() <= self.close_enough {
            player.set_rate(1.0);
            player.play();
            return Verdict::after(Correction::InSync, STEADY_RECHECK.as_secs_f64());
        }

        let rate = if delta > 0.0 {
            1.0 + self.rate_nudge
        } else {
            1.0 - self.rate_nudge
        };
        player.set_rate(rate);
        player.play();
        Verdict::after(Correction::Nudge { rate }, delta.abs() / self.rate_nudge)
    }
}

/// Software playhead: tracks position against a monotonic clock at a
/// variable rate. Used headless and as the position source for outputs
/// that cannot report one.
#[derive(Debug)]
pub struct ClockedPlayer {
    track: Option<PlayableTrack>,
    base_position: f64,
    started: Option<Instant>,
    rate: f64,
}

impl Default for ClockedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockedPlayer {
    pub fn new() -> Self {
        Self {
            track: None,
            base_position: 0.0,
            started: None,
            rate: 1.0,
        }
    }

    fn clamp(&self, position: f64) -> f64 {
        let position = position.max(0.0);
        match self.duration() {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    /// Fold the running segment into the base position
    fn checkpoint(&mut self) {
        self.base_position = self.position();
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }
}

impl Player for ClockedPlayer {
    fn loaded(&self) -> Option<&TrackId> {
        self.track.as_ref().map(|t| &t.track_id)
    }

    fn load(&mut self, track: PlayableTrack) {
        self.track = Some(track);
        self.base_position = 0.0;
        self.started = None;
        self.rate = 1.0;
    }

    fn position(&self) -> f64 {
        let running = self
            .started
            .map(|at| at.elapsed().as_secs_f64() * self.rate)
            .unwrap_or(0.0);
        self.clamp(self.base_position + running)
    }

    fn duration(&self) -> Option<f64> {
        self.track.as_ref().and_then(|t| t.duration)
    }

    fn is_playing(&self) -> bool {
        self.started.is_some()
    }

    fn play(&mut self) {
        if self.track.is_some() && self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.base_position = self.position();
        self.started = None;
    }

    fn seek(&mut self, position: f64) {
        self.base_position = self.clamp(position);
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    fn set_rate(&mut self, rate: f64) {
        if rate != self.rate {
            self.checkpoint();
            self.rate = rate;
        }
    }
}
