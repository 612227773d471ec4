//! Room State Store
//!
//! Owns every room's authoritative state. All writes go through this type:
//! guarded mutations are checked against the caller's last-seen version,
//! applied to a working copy, persisted, and only then made visible. Each
//! room has its own lock, so mutations of one room never interleave while
//! different rooms proceed independently.

mod persist;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, instrument};

use crate::barrier;
use crate::clock::wall_clock;
use crate::control::Action;
use crate::error::{Error, Result};
use crate::invariants::{assert_queue_invariants, assert_room_invariants};
use crate::models::{Participant, RoomCode, RoomState, Snapshot, TrackId, TrackIndex};

pub use persist::RoomFiles;

/// Receives every state that the store accepts, in acceptance order.
///
/// Called while the room is still held, so implementations must not block
/// and must not call back into the store.
pub trait StateObserver: Send + Sync {
    fn state_advanced(&self, snapshot: &Snapshot);
}

type RoomSlot = Arc<Mutex<RoomState>>;

/// Keyed collection of rooms with versioned read and conditional write
pub struct RoomStore {
    rooms: RwLock<HashMap<RoomCode, RoomSlot>>,
    index: Arc<TrackIndex>,
    files: RoomFiles,
    observer: Option<Arc<dyn StateObserver>>,
}

/// A panic while mutating only ever touches a working copy, so the committed
/// state behind a poisoned lock is still consistent.
fn lock(slot: &Mutex<RoomState>) -> MutexGuard<'_, RoomState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RoomStore {
    /// Load persisted rooms from `dir`, realigning each to `index`.
    ///
    /// Each restored room has its queue rebuilt, possession markers cleared
    /// and its version bumped once so that clients resynchronise. A single
    /// room over the whole index is created when nothing was persisted.
    #[instrument(skip(dir, index), fields(dir = %dir.as_ref().display(), tracks = index.len()))]
    pub fn open<P: AsRef<Path>>(dir: P, index: TrackIndex) -> Result<Self> {
        let files = RoomFiles::open(dir)?;
        let mut rooms = HashMap::new();

        for (code, mut state) in files.load_all()? {
            state.realign(&index);
            files.save(&code, &state)?;
            info!(
                room = %code,
                version = state.version,
                queue = state.queue.len(),
                "Restored room"
            );
            rooms.insert(code, Arc::new(Mutex::new(state)));
        }

        let store = Self {
            rooms: RwLock::new(rooms),
            index: Arc::new(index),
            files,
            observer: None,
        };

        if store.rooms().is_empty() {
            store.create_room(RoomCode::generate())?;
        }

        Ok(store)
    }

    /// Attach the observer notified after every accepted state
    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn index(&self) -> &Arc<TrackIndex> {
        &self.index
    }

    /// Codes of all rooms, sorted
    pub fn rooms(&self) -> Vec<RoomCode> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut codes: Vec<_> = rooms.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Create a room queueing the whole index in natural order
    pub fn create_room(&self, code: RoomCode) -> Result<Snapshot> {
        let state = RoomState::new(self.index.ids());
        self.files.save(&code, &state)?;
        info!(room = %code, tracks = state.queue.len(), "Created room");

        let snapshot = self.snapshot_of(&code, &state, wall_clock());
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code, Arc::new(Mutex::new(state)));
        Ok(snapshot)
    }

    fn room(&self, code: &RoomCode) -> Result<RoomSlot> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned()
            .ok_or_else(|| Error::RoomNotFound(code.to_string()))
    }

    fn snapshot_of(&self, code: &RoomCode, state: &RoomState, now: f64) -> Snapshot {
        Snapshot {
            room: code.clone(),
            room_state: state.clone(),
            index: self.index.clone(),
            server_now: now,
        }
    }

    /// Current state and version of a room
    pub fn read(&self, code: &RoomCode) -> Result<Snapshot> {
        self.read_with(code, Snapshot::clone)
    }

    /// Run `f` on the current snapshot while the room is held, so that no
    /// mutation can be accepted until `f` returns
    pub fn read_with<T>(&self, code: &RoomCode, f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        let slot = self.room(code)?;
        let state = lock(&slot);
        Ok(f(&self.snapshot_of(code, &state, wall_clock())))
    }

    /// Conditional write.
    ///
    /// Rejected with [`Error::Conflict`] (carrying the current state) unless
    /// `expected_version` equals the stored version. Otherwise `f` runs on a
    /// working copy; if it fails nothing changes, if it succeeds the version
    /// is bumped, the state is persisted, and observers are notified.
    pub fn mutate<F>(&self, code: &RoomCode, expected_version: u32, f: F) -> Result<Snapshot>
    where
        F: FnOnce(&mut RoomState, f64) -> Result<()>,
    {
        let slot = self.room(code)?;
        let mut current = lock(&slot);
        let now = wall_clock();

        if current.version != expected_version {
            debug!(
                room = %code,
                version = current.version,
                expected = expected_version,
                "Version conflict"
            );
            return Err(Error::Conflict {
                current: Box::new(self.snapshot_of(code, &current, now)),
            });
        }

        let mut working = current.clone();
        f(&mut working, now)?;
        self.commit(code, &mut current, working, now)
    }

    /// Unconditional server-side write. `f` reports whether anything
    /// observable changed; only then is the version bumped and the state
    /// persisted and broadcast.
    fn update<F>(&self, code: &RoomCode, f: F) -> Result<Snapshot>
    where
        F: FnOnce(&mut RoomState, f64) -> Result<bool>,
    {
        self.update_then(code, f, |_| ()).map(|(snapshot, ())| snapshot)
    }

    /// Like `update`, then run `then` on the resulting snapshot before the
    /// room is released
    fn update_then<F, T>(
        &self,
        code: &RoomCode,
        f: F,
        then: impl FnOnce(&Snapshot) -> T,
    ) -> Result<(Snapshot, T)>
    where
        F: FnOnce(&mut RoomState, f64) -> Result<bool>,
    {
        let slot = self.room(code)?;
        let mut current = lock(&slot);
        let now = wall_clock();

        let mut working = current.clone();
        let snapshot = if f(&mut working, now)? {
            self.commit(code, &mut current, working, now)?
        } else {
            *current = working;
            self.snapshot_of(code, &current, now)
        };
        let out = then(&snapshot);
        Ok((snapshot, out))
    }

    fn commit(
        &self,
        code: &RoomCode,
        current: &mut RoomState,
        mut working: RoomState,
        now: f64,
    ) -> Result<Snapshot> {
        working.play_state.promote(now);
        working.bump_version();
        assert_room_invariants(&working);
        assert_queue_invariants(&working.queue);

        self.files.save(code, &working)?;
        *current = working;

        let snapshot = self.snapshot_of(code, current, now);
        if let Some(observer) = &self.observer {
            observer.state_advanced(&snapshot);
        }
        Ok(snapshot)
    }

    /// Apply a user control action under the version guard, then re-check
    /// the barrier (the action may have entered `OnBarrier` with everyone
    /// already holding the head)
    pub fn control(&self, code: &RoomCode, expected_version: u32, action: &Action) -> Result<Snapshot> {
        let snapshot = self.mutate(code, expected_version, |state, now| {
            action.apply(state, &self.index, now, &mut rand::thread_rng())?;
            barrier::arm_if_satisfied(state, now);
            Ok(())
        })?;
        info!(
            room = %code,
            version = snapshot.version(),
            action = ?action,
            mode = snapshot.room_state.play_state.mode_name(),
            "Control accepted"
        );
        Ok(snapshot)
    }

    /// Record a participant joining (any connection counts as a heartbeat).
    /// `live` marks the connection as the participant's push subscription.
    pub fn join(&self, code: &RoomCode, client: &str, live: bool) -> Result<Snapshot> {
        self.join_with(code, client, live, |_| ())
            .map(|(snapshot, ())| snapshot)
    }

    /// Record a participant and run `then` on the resulting snapshot while
    /// the room is still held. A push subscription registered from `then`
    /// cannot be separated from the live flag by a concurrent disconnect.
    pub fn join_with<T>(
        &self,
        code: &RoomCode,
        client: &str,
        live: bool,
        then: impl FnOnce(&Snapshot) -> T,
    ) -> Result<(Snapshot, T)> {
        self.update_then(
            code,
            |state, now| {
                let mut created = false;
                let entry = state.clients.entry(client.to_string()).or_insert_with(|| {
                    created = true;
                    Participant::joined(now)
                });
                let was_fresh = entry.is_fresh(now);
                let was_live = entry.live;

                entry.last_heartbeat = now;
                if live {
                    entry.live = true;
                }

                if created {
                    info!(room = %code, client = client, "Participant joined");
                }
                Ok(created || !was_fresh || (live && !was_live))
            },
            then,
        )
    }

    /// Push subscription closed: clear the live flag and re-check the
    /// barrier, since the present set may have shrunk to satisfaction
    pub fn disconnect(&self, code: &RoomCode, client: &str) -> Result<Snapshot> {
        self.disconnect_when(code, client, || true)
    }

    /// Like [`disconnect`](Self::disconnect), but only if `release` returns
    /// true. `release` runs while the room is held, so a subscription can be
    /// released and the live flag cleared without a new subscription for
    /// the same participant slipping in between.
    pub fn disconnect_when(
        &self,
        code: &RoomCode,
        client: &str,
        release: impl FnOnce() -> bool,
    ) -> Result<Snapshot> {
        self.update(code, |state, now| {
            if !release() {
                return Ok(false);
            }
            let Some(entry) = state.clients.get_mut(client) else {
                return Ok(false);
            };
            if !entry.live {
                return Ok(false);
            }
            entry.live = false;
            if barrier::arm_if_satisfied(state, now) {
                info!(room = %code, client = client, "Barrier satisfied after disconnect");
            }
            Ok(true)
        })
    }

    /// Refresh a participant's heartbeat and evict everyone silent for too
    /// long. Returns the evicted participants.
    pub fn heartbeat(&self, code: &RoomCode, client: &str) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        self.update(code, |state, now| {
            let mut created = false;
            let entry = state.clients.entry(client.to_string()).or_insert_with(|| {
                created = true;
                Participant::joined(now)
            });
            let was_fresh = entry.is_fresh(now);
            entry.last_heartbeat = now;

            evicted = state.evict_stale(now);
            for name in &evicted {
                info!(room = %code, client = %name, "Evicting stale participant");
            }
            if !evicted.is_empty() {
                barrier::arm_if_satisfied(state, now);
            }
            Ok(created || !was_fresh || !evicted.is_empty())
        })?;
        Ok(evicted)
    }

    /// A participant asserts it holds `track` locally. Only accepted for the
    /// current head; may satisfy the barrier and arm playback.
    pub fn report_possession(&self, code: &RoomCode, client: &str, track: &TrackId) -> Result<Snapshot> {
        self.update(code, |state, now| {
            let head = state.head().cloned();
            if head.as_ref() != Some(track) {
                return Err(Error::NotHead {
                    expected: head,
                    got: track.clone(),
                });
            }
            let entry = state
                .clients
                .get_mut(client)
                .ok_or_else(|| Error::UnknownParticipant(client.to_string()))?;
            entry.acknowledged_head = Some(track.clone());

            if barrier::arm_if_satisfied(state, now) {
                info!(room = %code, track = %track, "Barrier satisfied, start armed");
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ARM_LEAD_SECS;
    use crate::models::{PlayState, TrackEntry, EVENT_MODULO};

    fn index() -> TrackIndex {
        TrackIndex::new(
            ["one.mp3", "two.mp3", "three.mp3"]
                .iter()
                .map(|n| TrackEntry::from_file_name(n, 10))
                .collect(),
        )
    }

    fn open_store(dir: &Path) -> (RoomStore, RoomCode) {
        let store = RoomStore::open(dir, index()).unwrap();
        let code = store.rooms().remove(0);
        (store, code)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u32>>);

    impl StateObserver for Recorder {
        fn state_advanced(&self, snapshot: &Snapshot) {
            self.0.lock().unwrap().push(snapshot.version());
        }
    }

    #[test]
    fn test_open_creates_single_room() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());

        assert_eq!(store.rooms().len(), 1);
        let snapshot = store.read(&code).unwrap();
        assert_eq!(snapshot.room_state.queue, index().ids());
        assert_eq!(snapshot.version(), 0);
    }

    #[test]
    fn test_accepted_mutations_bump_version_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());

        for n in 0..5u32 {
            let snapshot = store.control(&code, n, &Action::Shuffle).unwrap();
            assert_eq!(snapshot.version(), n + 1);
        }
    }

    #[test]
    fn test_conflict_leaves_version_and_carries_state() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        store.control(&code, 0, &Action::Next).unwrap();

        let err = store.control(&code, 0, &Action::Next).unwrap_err();
        match err {
            Error::Conflict { current } => assert_eq!(current.version(), 1),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.read(&code).unwrap().version(), 1);
    }

    #[test]
    fn test_failed_mutation_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        let before = store.read(&code).unwrap();

        let result = store.control(
            &code,
            0,
            &Action::Nudge {
                track: "missing".into(),
            },
        );
        assert!(matches!(result, Err(Error::TrackNotFound(_))));
        assert_eq!(store.read(&code).unwrap().room_state, before.room_state);
    }

    #[test]
    fn test_version_wraps_at_modulo() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        {
            let slot = store.room(&code).unwrap();
            lock(&slot).version = EVENT_MODULO - 1;
        }
        let snapshot = store
            .control(&code, EVENT_MODULO - 1, &Action::Pause)
            .unwrap();
        assert_eq!(snapshot.version(), 0);
    }

    #[test]
    fn test_observer_sees_every_accepted_state_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = RoomStore::open(dir.path(), index())
            .unwrap()
            .with_observer(recorder.clone());
        let code = store.rooms().remove(0);

        store.control(&code, 0, &Action::Next).unwrap();
        let _ = store.control(&code, 0, &Action::Next);
        store.control(&code, 1, &Action::Prev).unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_head_change_resets_acks_and_waits_on_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        let head = store.read(&code).unwrap().room_state.queue[0].clone();

        store.join(&code, "alice", true).unwrap();
        store.join(&code, "bob", true).unwrap();
        store.report_possession(&code, "alice", &head).unwrap();

        let version = store.read(&code).unwrap().version();
        let snapshot = store.control(&code, version, &Action::Next).unwrap();

        assert!(matches!(
            snapshot.room_state.play_state,
            PlayState::OnBarrier { .. }
        ));
        assert!(snapshot
            .room_state
            .clients
            .values()
            .all(|c| c.acknowledged_head.is_none()));
    }

    #[test]
    fn test_possession_of_non_head_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        store.join(&code, "alice", true).unwrap();
        let before = store.read(&code).unwrap().version();

        let next = store.read(&code).unwrap().room_state.queue[1].clone();
        let err = store.report_possession(&code, "alice", &next).unwrap_err();

        assert!(matches!(err, Error::NotHead { .. }));
        assert_eq!(store.read(&code).unwrap().version(), before);
    }

    #[test]
    fn test_unknown_room() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        let err = store.read(&RoomCode::new("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rejoin_when_fresh_is_not_a_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        store.join(&code, "alice", true).unwrap();
        let version = store.read(&code).unwrap().version();

        store.join(&code, "alice", false).unwrap();
        assert!(store.heartbeat(&code, "alice").unwrap().is_empty());
        assert_eq!(store.read(&code).unwrap().version(), version);
    }

    #[test]
    fn test_reconnect_racing_old_close_stays_live() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        // Stand-in for the push registry: the participant's current subscription
        let registry: Mutex<Option<u64>> = Mutex::new(None);

        for _ in 0..200 {
            store
                .join_with(&code, "a", true, |_| *registry.lock().unwrap() = Some(1))
                .unwrap();

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    store
                        .disconnect_when(&code, "a", || {
                            let mut current = registry.lock().unwrap();
                            if *current == Some(1) {
                                *current = None;
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap();
                });
                scope.spawn(|| {
                    store
                        .join_with(&code, "a", true, |_| *registry.lock().unwrap() = Some(2))
                        .unwrap();
                });
            });

            assert_eq!(*registry.lock().unwrap(), Some(2));
            assert!(store.read(&code).unwrap().room_state.clients["a"].live);
        }
    }

    #[test]
    fn test_join_with_runs_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());

        let (snapshot, seen) = store
            .join_with(&code, "a", true, |s| s.version())
            .unwrap();

        assert_eq!(seen, snapshot.version());
        assert_eq!(seen, 1);
        assert!(snapshot.room_state.clients["a"].live);
    }

    #[test]
    fn test_barrier_releases_when_last_holdout_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (store, code) = open_store(dir.path());
        for name in ["a", "b", "c"] {
            store.join(&code, name, true).unwrap();
        }
        let version = store.read(&code).unwrap().version();
        let snapshot = store.control(&code, version, &Action::Play).unwrap();
        assert!(matches!(
            snapshot.room_state.play_state,
            PlayState::OnBarrier { .. }
        ));

        let head = snapshot.room_state.queue[0].clone();
        store.report_possession(&code, "a", &head).unwrap();
        let snapshot = store.report_possession(&code, "b", &head).unwrap();
        assert!(matches!(
            snapshot.room_state.play_state,
            PlayState::OnBarrier { .. }
        ));

        let before = wall_clock();
        let snapshot = store.disconnect(&code, "c").unwrap();
        let after = wall_clock();

        let anchor = snapshot
            .room_state
            .play_state
            .anchor()
            .expect("start should be anchored");
        assert!(anchor >= before && anchor <= after + ARM_LEAD_SECS);
    }

    #[test]
    fn test_restart_recovers_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let code = {
            let (store, code) = open_store(dir.path());
            store.join(&code, "alice", true).unwrap();
            let head = store.read(&code).unwrap().room_state.queue[0].clone();
            store.report_possession(&code, "alice", &head).unwrap();
            code
        };
        let before = {
            let files = RoomFiles::open(dir.path()).unwrap();
            files.load_all().unwrap().remove(0).1
        };

        let (store, reopened) = open_store(dir.path());
        assert_eq!(reopened, code);
        let state = store.read(&code).unwrap().room_state;
        assert_eq!(state.version, before.version + 1);
        assert!(state.clients.values().all(|c| c.acknowledged_head.is_none() && !c.live));
    }

    #[test]
    fn test_reload_with_removed_head_uses_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let files = RoomFiles::open(dir.path()).unwrap();
            let state = RoomState::new(vec!["deleted-track".into(), index().ids()[2].clone()]);
            files.save(&RoomCode::new("room1"), &state).unwrap();
        }

        let (store, code) = open_store(dir.path());
        assert_eq!(code, RoomCode::new("room1"));
        assert_eq!(store.read(&code).unwrap().room_state.queue, index().ids());
    }
}
