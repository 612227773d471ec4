//! Client session
//!
//! Wires one connection to the background tasks a listening participant
//! needs: clock sync, convergence, prefetch and heartbeats.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use unison_core::{BlobStore, ClockEstimator, RoomCode};

use crate::client::{Client, ClientEvent};
use crate::clock_sync::{lock_clock, run_clock_sync, server_now, SharedClock};
use crate::convergence::{lock_player, run_convergence, SharedPlayer};
use crate::error::{Error, Result};
use crate::prefetch::{run_prefetch, PrefetchManager};

/// Interval between presence heartbeats
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

pub struct Session {
    client: Client,
    player: SharedPlayer,
    clock: SharedClock,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Join `room` and start every background task. Without `cache_db`, or
    /// when it cannot be opened, tracks are held in memory only.
    pub async fn start(
        addr: SocketAddr,
        room: RoomCode,
        name: impl Into<String>,
        player: SharedPlayer,
        cache_db: Option<&Path>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let (client, events) = Client::connect(addr, room, name).await?;

        let store = match cache_db.map(BlobStore::open) {
            Some(Ok(store)) => Some(store),
            Some(Err(e)) => {
                warn!(error = %e, "Could not open track cache");
                let _ = client
                    .event_sender()
                    .send(ClientEvent::CacheDisabled(e.to_string()));
                None
            }
            None => None,
        };

        let clock: SharedClock = Arc::new(Mutex::new(ClockEstimator::default()));
        let loaded = Arc::new(Notify::new());
        let (shutdown, _) = broadcast::channel(1);

        let prefetch = PrefetchManager::new(
            client.clone(),
            store,
            player.clone(),
            loaded.clone(),
            client.event_sender(),
            client.name(),
        );

        let tasks = vec![
            tokio::spawn(run_clock_sync(
                client.clone(),
                clock.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(run_convergence(
                client.clone(),
                player.clone(),
                clock.clone(),
                loaded,
                shutdown.subscribe(),
            )),
            tokio::spawn(run_prefetch(prefetch, client.clone(), shutdown.subscribe())),
            tokio::spawn(run_heartbeat(client.clone(), shutdown.subscribe())),
        ];

        info!(room = %client.room(), name = %client.name(), "Session started");
        Ok((
            Self {
                client,
                player,
                clock,
                shutdown,
                tasks,
            },
            events,
        ))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn clock_diagnostic(&self) -> String {
        lock_clock(&self.clock).diagnostic()
    }

    /// One-line summary of the room as this participant sees it
    pub fn status_line(&self) -> String {
        let snapshot = self.client.snapshot();
        let state = &snapshot.room_state;
        let now = server_now(&self.clock).unwrap_or(snapshot.server_now);
        let readiness = state.readiness(now);
        let title = state
            .head()
            .map(|id| {
                snapshot
                    .index
                    .get(id)
                    .map_or_else(|| id.clone(), |e| e.title.clone())
            })
            .unwrap_or_else(|| "(empty queue)".to_string());
        let position = lock_player(&self.player).position();

        format!(
            "[{}] {} {}/{} ready | {} @ {:.1}s | clock {}",
            state.version,
            state.play_state.mode_name(),
            readiness.ready,
            readiness.present,
            title,
            position,
            self.clock_diagnostic()
        )
    }

    /// Stop every task and close the connection
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        self.client.disconnect();
        info!("Session closed");
    }
}

async fn run_heartbeat(client: Client, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }
        match client.heartbeat().await {
            Ok(()) => {}
            Err(Error::ConnectionClosed | Error::NotConnected) => break,
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
    debug!("Heartbeat stopped");
}
