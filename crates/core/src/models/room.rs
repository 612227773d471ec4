//! Room model - the authoritative shared playback state of one room

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::track::{TrackId, TrackIndex};

/// Room versions wrap at this value (2^14)
pub const EVENT_MODULO: u32 = 16384;

/// A participant is present only if its last heartbeat is at most this old
pub const HEARTBEAT_STALE_SECS: f64 = 6.0;

/// Participants silent for longer than this are evicted on the next heartbeat
pub const EVICT_AFTER_SECS: f64 = HEARTBEAT_STALE_SECS * 2.0;

/// Length of generated room codes
pub const ROOM_CODE_LENGTH: usize = 6;

/// Short human-shareable room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Random lowercase alphanumeric code
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let code = (0..ROOM_CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect::<String>();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What the room is doing. Each mode carries only the fields meaningful to it.
///
/// Times are server wall-clock seconds since the Unix epoch; positions are
/// seconds into the head track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PlayState {
    /// Stopped at a stored position
    Paused { position: f64 },
    /// Waiting for every present participant to hold the head track.
    /// Playback resumes from `resume_position` once armed.
    OnBarrier { resume_position: f64 },
    /// Start scheduled: position zero of the head occurs at the anchor,
    /// which is still in the future
    Armed { wall_time_at_song_start: f64 },
    /// Playing: position zero of the head occurred at the anchor
    Playing { wall_time_at_song_start: f64 },
}

impl PlayState {
    pub fn paused_at(position: f64) -> Self {
        PlayState::Paused {
            position: position.max(0.0),
        }
    }

    /// Anchor timestamp when the mode has one
    pub fn anchor(&self) -> Option<f64> {
        match self {
            PlayState::Armed {
                wall_time_at_song_start,
            }
            | PlayState::Playing {
                wall_time_at_song_start,
            } => Some(*wall_time_at_song_start),
            _ => None,
        }
    }

    /// True for Armed and Playing (clients treat them identically)
    pub fn is_rolling(&self) -> bool {
        self.anchor().is_some()
    }

    /// Position in the head track at server time `now`
    pub fn position_at(&self, now: f64) -> f64 {
        match self {
            PlayState::Paused { position } => *position,
            PlayState::OnBarrier { resume_position } => *resume_position,
            PlayState::Armed {
                wall_time_at_song_start,
            }
            | PlayState::Playing {
                wall_time_at_song_start,
            } => (now - wall_time_at_song_start).max(0.0),
        }
    }

    /// Record an Armed state whose anchor has passed as Playing
    pub fn promote(&mut self, now: f64) {
        if let PlayState::Armed {
            wall_time_at_song_start,
        } = *self
        {
            if wall_time_at_song_start <= now {
                *self = PlayState::Playing {
                    wall_time_at_song_start,
                };
            }
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            PlayState::Paused { .. } => "paused",
            PlayState::OnBarrier { .. } => "on_barrier",
            PlayState::Armed { .. } => "armed",
            PlayState::Playing { .. } => "playing",
        }
    }
}

impl Default for PlayState {
    fn default() -> Self {
        PlayState::Paused { position: 0.0 }
    }
}

/// Server-side record of one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Server wall time of the last heartbeat (or join)
    pub last_heartbeat: f64,
    /// Whether a push subscription is currently open
    pub live: bool,
    /// Head track this participant last reported holding
    pub acknowledged_head: Option<TrackId>,
}

impl Participant {
    pub fn joined(now: f64) -> Self {
        Self {
            last_heartbeat: now,
            live: false,
            acknowledged_head: None,
        }
    }

    pub fn is_fresh(&self, now: f64) -> bool {
        now - self.last_heartbeat <= HEARTBEAT_STALE_SECS
    }

    /// Fresh heartbeat and an open push subscription
    pub fn is_present(&self, now: f64) -> bool {
        self.live && self.is_fresh(now)
    }
}

/// Ready/present head-count for status display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub ready: usize,
    pub present: usize,
}

/// Authoritative state of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub version: u32,
    /// Circular queue of track ids; `queue[0]` is the head
    pub queue: Vec<TrackId>,
    pub play_state: PlayState,
    #[serde(default)]
    pub clients: BTreeMap<String, Participant>,
}

impl RoomState {
    pub fn new(queue: Vec<TrackId>) -> Self {
        Self {
            version: 0,
            queue,
            play_state: PlayState::default(),
            clients: BTreeMap::new(),
        }
    }

    pub fn head(&self) -> Option<&TrackId> {
        self.queue.first()
    }

    pub fn next_up(&self) -> Option<&TrackId> {
        self.queue.get(1)
    }

    /// Advance the version by one, wrapping at [`EVENT_MODULO`]
    pub fn bump_version(&mut self) {
        self.version = (self.version + 1) % EVENT_MODULO;
    }

    /// Names of participants that are present at `now`
    pub fn present_participants(&self, now: f64) -> impl Iterator<Item = (&String, &Participant)> {
        self.clients.iter().filter(move |(_, c)| c.is_present(now))
    }

    pub fn readiness(&self, now: f64) -> Readiness {
        let head = self.head();
        self.present_participants(now)
            .fold(Readiness::default(), |mut acc, (_, c)| {
                acc.present += 1;
                if head.is_some() && c.acknowledged_head.as_ref() == head {
                    acc.ready += 1;
                }
                acc
            })
    }

    /// Forget every possession report. Required whenever the head changes.
    pub fn clear_acknowledgments(&mut self) {
        for client in self.clients.values_mut() {
            client.acknowledged_head = None;
        }
    }

    /// Drop participants silent for longer than [`EVICT_AFTER_SECS`].
    /// Returns the evicted names.
    pub fn evict_stale(&mut self, now: f64) -> Vec<String> {
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, c)| now - c.last_heartbeat > EVICT_AFTER_SECS)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.clients.remove(name);
        }
        stale
    }

    /// Bring a freshly loaded state in line with the current track index.
    ///
    /// The queue is rebuilt from the index in natural order, rotated so the
    /// previous head stays at the head when it still exists. No push
    /// connection survives a restart, so every participant is marked offline
    /// and must re-assert possession.
    pub fn realign(&mut self, index: &TrackIndex) {
        let previous_head = self.head().cloned();
        self.queue = index.ids_starting_at(previous_head.as_deref());
        for client in self.clients.values_mut() {
            client.acknowledged_head = None;
            client.live = false;
        }
        if previous_head.as_ref() != self.head() {
            self.play_state = PlayState::default();
        }
        self.bump_version();
    }
}

/// Serial-number comparison for wrapping versions: true if `candidate`
/// is ahead of `current` by less than half the version space.
pub fn version_is_newer(candidate: u32, current: u32) -> bool {
    let distance = (candidate + EVENT_MODULO - current) % EVENT_MODULO;
    distance != 0 && distance < EVENT_MODULO / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::track::TrackEntry;

    fn index_of(names: &[&str]) -> TrackIndex {
        TrackIndex::new(
            names
                .iter()
                .map(|n| TrackEntry::from_file_name(n, 1))
                .collect(),
        )
    }

    fn participant(now: f64, live: bool, ack: Option<&str>) -> Participant {
        Participant {
            last_heartbeat: now,
            live,
            acknowledged_head: ack.map(str::to_string),
        }
    }

    #[test]
    fn test_version_wraps() {
        let mut state = RoomState::new(vec![]);
        state.version = EVENT_MODULO - 1;
        state.bump_version();
        assert_eq!(state.version, 0);
    }

    #[test]
    fn test_version_is_newer_across_wrap() {
        assert!(version_is_newer(1, 0));
        assert!(version_is_newer(0, EVENT_MODULO - 1));
        assert!(!version_is_newer(5, 5));
        assert!(!version_is_newer(4, 5));
    }

    #[test]
    fn test_presence_requires_live_and_fresh() {
        let now = 1000.0;
        assert!(participant(now - 1.0, true, None).is_present(now));
        assert!(!participant(now - 1.0, false, None).is_present(now));
        assert!(!participant(now - HEARTBEAT_STALE_SECS - 0.5, true, None).is_present(now));
    }

    #[test]
    fn test_readiness_counts() {
        let now = 50.0;
        let mut state = RoomState::new(vec!["a".into(), "b".into()]);
        state.clients.insert("x".into(), participant(now, true, Some("a")));
        state.clients.insert("y".into(), participant(now, true, None));
        state.clients.insert("z".into(), participant(now, false, Some("a")));

        assert_eq!(state.readiness(now), Readiness { ready: 1, present: 2 });
    }

    #[test]
    fn test_evict_stale() {
        let now = 100.0;
        let mut state = RoomState::new(vec![]);
        state.clients.insert("old".into(), participant(now - 20.0, true, None));
        state.clients.insert("new".into(), participant(now - 2.0, true, None));

        let evicted = state.evict_stale(now);
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(state.clients.contains_key("new"));
    }

    #[test]
    fn test_promote_armed_once_anchor_passes() {
        let mut ps = PlayState::Armed {
            wall_time_at_song_start: 10.0,
        };
        ps.promote(9.0);
        assert_eq!(ps.mode_name(), "armed");
        ps.promote(10.5);
        assert_eq!(
            ps,
            PlayState::Playing {
                wall_time_at_song_start: 10.0
            }
        );
    }

    #[test]
    fn test_realign_keeps_existing_head() {
        let index = index_of(&["a.mp3", "b.mp3", "c.mp3"]);
        let ids = index.ids();
        let mut state = RoomState::new(vec![ids[1].clone(), ids[0].clone()]);
        state.clients.insert("x".into(), participant(1.0, true, Some(ids[1].as_str())));
        state.version = 7;

        state.realign(&index);

        assert_eq!(state.queue, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
        assert_eq!(state.version, 8);
        let x = &state.clients["x"];
        assert!(!x.live);
        assert!(x.acknowledged_head.is_none());
    }

    #[test]
    fn test_realign_with_removed_head_falls_back_to_natural_order() {
        let index = index_of(&["a.mp3", "b.mp3"]);
        let mut state = RoomState::new(vec!["gone".into(), index.ids()[1].clone()]);
        state.play_state = PlayState::paused_at(42.0);

        state.realign(&index);

        assert_eq!(state.queue, index.ids());
        assert_eq!(state.play_state, PlayState::default());
    }

    #[test]
    fn test_play_state_json_is_tagged() {
        let json = serde_json::to_value(PlayState::OnBarrier {
            resume_position: 3.0,
        })
        .unwrap();
        assert_eq!(json["mode"], "on_barrier");
        assert_eq!(json["resume_position"], 3.0);
    }
}
