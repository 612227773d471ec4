//! Retention policy for cached tracks
//!
//! Protection is by explicit identifier, not access time: the head, the
//! next-up track and a short list of recently played tracks survive an
//! eviction pass. Everything else is dropped.

use std::collections::{HashSet, VecDeque};

use crate::models::{RoomState, TrackId};

/// Number of recently played tracks kept beyond head and next-up
pub const RECENT_KEEP: usize = 3;

/// Most-recently played tracks, newest last
#[derive(Debug, Clone)]
pub struct RecentTracks {
    tracks: VecDeque<TrackId>,
    capacity: usize,
}

impl Default for RecentTracks {
    fn default() -> Self {
        Self::new(RECENT_KEEP)
    }
}

impl RecentTracks {
    pub fn new(capacity: usize) -> Self {
        Self {
            tracks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Mark `track` as just played, moving it to the newest slot
    pub fn touch(&mut self, track: &TrackId) {
        self.tracks.retain(|t| t != track);
        self.tracks.push_back(track.clone());
        while self.tracks.len() > self.capacity {
            self.tracks.pop_front();
        }
    }

    pub fn contains(&self, track: &TrackId) -> bool {
        self.tracks.contains(track)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackId> {
        self.tracks.iter()
    }
}

/// Tracks that must survive an eviction pass for `state`
pub fn protected_set(state: &RoomState, recent: &RecentTracks) -> HashSet<TrackId> {
    state
        .head()
        .into_iter()
        .chain(state.next_up())
        .chain(recent.iter())
        .cloned()
        .collect()
}

/// Cached tracks not covered by `protected`, in input order
pub fn eviction_candidates<'a>(
    cached: &'a [TrackId],
    protected: &'a HashSet<TrackId>,
) -> impl Iterator<Item = &'a TrackId> {
    cached.iter().filter(move |t| !protected.contains(*t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_keeps_newest() {
        let mut recent = RecentTracks::new(3);
        for t in ["a", "b", "c", "d"] {
            recent.touch(&t.to_string());
        }
        let kept: Vec<_> = recent.iter().cloned().collect();
        assert_eq!(kept, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_touch_refreshes_existing() {
        let mut recent = RecentTracks::new(2);
        recent.touch(&"a".to_string());
        recent.touch(&"b".to_string());
        recent.touch(&"a".to_string());
        recent.touch(&"c".to_string());
        assert!(recent.contains(&"a".to_string()));
        assert!(!recent.contains(&"b".to_string()));
    }

    #[test]
    fn test_protected_set_and_candidates() {
        let state = RoomState::new(vec!["h".into(), "n".into(), "x".into(), "y".into()]);
        let mut recent = RecentTracks::default();
        recent.touch(&"old".to_string());

        let protected = protected_set(&state, &recent);
        assert_eq!(protected.len(), 3);

        let cached: Vec<TrackId> = ["h", "x", "old", "n", "y"].iter().map(|s| s.to_string()).collect();
        let evict: Vec<_> = eviction_candidates(&cached, &protected).cloned().collect();
        assert_eq!(evict, vec!["x", "y"]);
    }
}
