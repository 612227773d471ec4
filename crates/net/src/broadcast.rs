//! Event Broadcaster
//!
//! Per-room registry of push subscriptions. Every state the store accepts is
//! encoded once and queued on each subscription; a subscription whose
//! connection has gone away is dropped during the same pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};
use unison_core::{RoomCode, Snapshot, StateObserver};

use crate::frame::encode_frame;
use crate::protocol::Message;

/// Identifies one subscription, so that a stale connection closing cannot
/// remove the subscription that replaced it
pub type SubscriptionId = u64;

/// Queued bytes for a connection's writer
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A complete encoded message frame
    Frame(Arc<[u8]>),
    /// An encoded reply frame immediately followed by a blob frame
    Track { header: Arc<[u8]>, bytes: Arc<[u8]> },
}

struct Subscription {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Outbound>,
    /// Wakes the owning connection when it should close
    closer: Arc<Notify>,
}

/// Push fan-out for every room
#[derive(Default)]
pub struct Broadcaster {
    rooms: Mutex<HashMap<RoomCode, HashMap<String, Subscription>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomCode, HashMap<String, Subscription>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `client`'s push subscription in `room`. A previous
    /// subscription for the same participant is replaced and its connection
    /// asked to close.
    pub fn subscribe(
        &self,
        room: &RoomCode,
        client: &str,
        tx: mpsc::UnboundedSender<Outbound>,
        closer: Arc<Notify>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .rooms()
            .entry(room.clone())
            .or_default()
            .insert(client.to_string(), Subscription { id, tx, closer });

        if let Some(old) = replaced {
            debug!(room = %room, client = client, "Replacing push subscription");
            old.closer.notify_one();
        }
        id
    }

    /// Remove a subscription if it is still the current one for `client`.
    /// Returns true if it was removed.
    pub fn unsubscribe(&self, room: &RoomCode, client: &str, id: SubscriptionId) -> bool {
        let mut rooms = self.rooms();
        let Some(subs) = rooms.get_mut(room) else {
            return false;
        };
        if subs.get(client).map(|s| s.id) != Some(id) {
            return false;
        }
        subs.remove(client);
        if subs.is_empty() {
            rooms.remove(room);
        }
        true
    }

    /// Drop `client`'s subscription and close its connection
    pub fn drop_client(&self, room: &RoomCode, client: &str) {
        let removed = self.rooms().get_mut(room).and_then(|subs| subs.remove(client));
        if let Some(sub) = removed {
            debug!(room = %room, client = client, "Dropping push subscription");
            sub.closer.notify_one();
        }
    }

    pub fn subscriber_count(&self, room: &RoomCode) -> usize {
        self.rooms().get(room).map_or(0, HashMap::len)
    }

    /// Queue an encoded frame on every subscription of `room`
    fn publish(&self, room: &RoomCode, frame: Arc<[u8]>) {
        let mut rooms = self.rooms();
        let Some(subs) = rooms.get_mut(room) else {
            return;
        };
        subs.retain(|client, sub| {
            let alive = sub.tx.send(Outbound::Frame(frame.clone())).is_ok();
            if !alive {
                debug!(room = %room, client = %client, "Push connection gone");
            }
            alive
        });
    }
}

impl StateObserver for Broadcaster {
    fn state_advanced(&self, snapshot: &Snapshot) {
        let msg = Message::Snapshot {
            snapshot: Box::new(snapshot.clone()),
        };
        match encode_frame(&msg) {
            Ok(frame) => self.publish(&snapshot.room, frame.into()),
            Err(e) => error!(room = %snapshot.room, error = %e, "Failed to encode snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_core::{RoomState, TrackIndex};

    fn snapshot(room: &RoomCode, version: u32) -> Snapshot {
        let mut room_state = RoomState::new(vec!["t1".into()]);
        room_state.version = version;
        Snapshot {
            room: room.clone(),
            room_state,
            index: Arc::new(TrackIndex::default()),
            server_now: 0.0,
        }
    }

    fn channel() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_publish_reaches_room_subscribers_only() {
        let hub = Broadcaster::new();
        let room = RoomCode::new("aaaaaa");
        let other = RoomCode::new("bbbbbb");
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        hub.subscribe(&room, "a", tx_a, Arc::new(Notify::new()));
        hub.subscribe(&other, "b", tx_b, Arc::new(Notify::new()));

        hub.state_advanced(&snapshot(&room, 3));

        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Frame(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_dead_subscription_removed_during_broadcast() {
        let hub = Broadcaster::new();
        let room = RoomCode::new("aaaaaa");
        let (tx_a, rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        hub.subscribe(&room, "a", tx_a, Arc::new(Notify::new()));
        hub.subscribe(&room, "b", tx_b, Arc::new(Notify::new()));
        drop(rx_a);

        hub.state_advanced(&snapshot(&room, 1));

        assert_eq!(hub.subscriber_count(&room), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_stale_unsubscribe_keeps_replacement() {
        let hub = Broadcaster::new();
        let room = RoomCode::new("aaaaaa");
        let old_closer = Arc::new(Notify::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let first = hub.subscribe(&room, "a", tx1, old_closer.clone());
        let second = hub.subscribe(&room, "a", tx2, Arc::new(Notify::new()));

        assert!(!hub.unsubscribe(&room, "a", first));
        assert_eq!(hub.subscriber_count(&room), 1);
        assert!(hub.unsubscribe(&room, "a", second));
        assert_eq!(hub.subscriber_count(&room), 0);
    }

    #[tokio::test]
    async fn test_drop_client_signals_connection() {
        let hub = Broadcaster::new();
        let room = RoomCode::new("aaaaaa");
        let closer = Arc::new(Notify::new());
        let (tx, _rx) = channel();
        hub.subscribe(&room, "a", tx, closer.clone());

        hub.drop_client(&room, "a");

        tokio::time::timeout(std::time::Duration::from_secs(1), closer.notified())
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count(&room), 0);
    }
}
