//! Cache & Prefetch Manager
//!
//! Reacts to snapshots in which this participant has not yet acknowledged
//! the head: prunes the cache, makes sure the head's bytes are held locally,
//! loads them into the player and only then reports possession. The next-up
//! track is fetched ahead of time without being reported.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};
use unison_core::cache::{eviction_candidates, protected_set, RecentTracks};
use unison_core::{BlobStore, PlayableTrack, Snapshot, TrackId};

use crate::client::{Client, ClientEvent};
use crate::convergence::{lock_player, SharedPlayer};
use crate::error::Result;

/// Where track bytes come from and where possession is reported
pub trait TrackSource: Send + Sync {
    fn fetch(&self, track: &TrackId) -> impl Future<Output = Result<Vec<u8>>> + Send;
    fn report_possession(&self, track: &TrackId) -> impl Future<Output = Result<()>> + Send;
}

impl TrackSource for Client {
    async fn fetch(&self, track: &TrackId) -> Result<Vec<u8>> {
        self.fetch_track(track).await
    }

    async fn report_possession(&self, track: &TrackId) -> Result<()> {
        Client::report_possession(self, track).await
    }
}

pub struct PrefetchManager<S: TrackSource> {
    source: S,
    /// `None` once the blob store has failed; playback then runs from memory
    store: Option<BlobStore>,
    recent: RecentTracks,
    player: SharedPlayer,
    loaded: Arc<Notify>,
    events: mpsc::UnboundedSender<ClientEvent>,
    participant: String,
    last_head: Option<TrackId>,
}

impl<S: TrackSource> PrefetchManager<S> {
    pub fn new(
        source: S,
        store: Option<BlobStore>,
        player: SharedPlayer,
        loaded: Arc<Notify>,
        events: mpsc::UnboundedSender<ClientEvent>,
        participant: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            recent: RecentTracks::default(),
            player,
            loaded,
            events,
            participant: participant.into(),
            last_head: None,
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Switch caching off after a blob store failure. Not retried.
    fn disable_cache(&mut self, e: unison_core::Error) {
        error!(error = %e, "Track cache failed; continuing without it");
        self.store = None;
        let _ = self.events.send(ClientEvent::CacheDisabled(e.to_string()));
    }

    /// Bring local state in line with `snapshot`
    pub async fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let state = &snapshot.room_state;
        let Some(head) = state.head().cloned() else {
            return Ok(());
        };

        let acknowledged = state
            .clients
            .get(&self.participant)
            .and_then(|c| c.acknowledged_head.as_ref());
        let loaded = lock_player(&self.player).loaded() == Some(&head);
        if acknowledged == Some(&head) && loaded {
            return Ok(());
        }

        if self.last_head.as_ref() != Some(&head) {
            if let Some(previous) = self.last_head.take() {
                self.recent.touch(&previous);
            }
            self.evict(snapshot);
        }

        if !loaded {
            let bytes = self.ensure(&head, snapshot).await?;
            let track = PlayableTrack::new(head.clone(), bytes, snapshot.index.get(&head));
            lock_player(&self.player).load(track);
            self.loaded.notify_one();
        }

        self.source.report_possession(&head).await?;
        self.last_head = Some(head.clone());
        debug!(track = %head, "Reported possession");

        if let Some(next) = state.next_up().filter(|n| **n != head).cloned() {
            if let Err(e) = self.prefetch(&next, snapshot).await {
                debug!(track = %next, error = %e, "Prefetch of next track failed");
            }
        }
        Ok(())
    }

    /// Drop every cached track outside the protected set
    fn evict(&mut self, snapshot: &Snapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let protected = protected_set(&snapshot.room_state, &self.recent);
        let result = store.keys().and_then(|keys| {
            let mut evicted = 0;
            for track in eviction_candidates(&keys, &protected) {
                if store.delete(track)? {
                    evicted += 1;
                }
            }
            Ok(evicted)
        });
        match result {
            Ok(0) => {}
            Ok(evicted) => debug!(evicted, "Pruned track cache"),
            Err(e) => self.disable_cache(e),
        }
    }

    fn cached(&mut self, track: &TrackId) -> Option<Vec<u8>> {
        let lookup = self.store.as_ref()?.get(track);
        match lookup {
            Ok(bytes) => bytes,
            Err(e) => {
                self.disable_cache(e);
                None
            }
        }
    }

    fn keep(&mut self, track: &TrackId, bytes: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.put(track, bytes) {
            self.disable_cache(e);
        }
    }

    /// Bytes of `track`, from the cache or else the network (then cached)
    async fn ensure(&mut self, track: &TrackId, snapshot: &Snapshot) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.cached(track) {
            return Ok(bytes.into());
        }

        let title = snapshot
            .index
            .get(track)
            .map_or_else(|| track.clone(), |e| e.title.clone());
        info!(track = %track, title = %title, "Fetching track");

        let bytes = match self.source.fetch(track).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(track = %track, error = %e, "Track fetch failed");
                let _ = self
                    .events
                    .send(ClientEvent::Notice(format!("Could not load {}: {}", title, e)));
                return Err(e);
            }
        };
        self.keep(track, &bytes);
        Ok(bytes.into())
    }

    /// Fetch `track` into the cache without loading or reporting it
    async fn prefetch(&mut self, track: &TrackId, snapshot: &Snapshot) -> Result<()> {
        let present = match &self.store {
            Some(store) => store.contains(track),
            None => return Ok(()),
        };
        match present {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                self.disable_cache(e);
                return Ok(());
            }
        }
        self.ensure(track, snapshot).await.map(|_| ())
    }
}

/// Run `manager` against every snapshot until shutdown. A failed pass is
/// retried on the next snapshot, not in a loop.
pub async fn run_prefetch<S: TrackSource>(
    mut manager: PrefetchManager<S>,
    client: Client,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut snapshots = client.watch();
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(e) = manager.on_snapshot(&snapshot).await {
            warn!(error = %e, "Could not prepare head track");
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!("Prefetch stopped");
}
