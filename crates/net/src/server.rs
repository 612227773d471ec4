//! TCP room server
//!
//! Every connection opens with a `Hello`. A subscribing connection becomes
//! the participant's push channel: it receives every accepted snapshot of
//! its room, and closing it clears the participant's live flag and re-checks
//! the barrier. Requests are answered in order on the same connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};
use unison_core::{wall_clock, RoomCode, RoomStore, TrackId};

use crate::broadcast::{Broadcaster, Outbound, SubscriptionId};
use crate::error::{Error, Result};
use crate::frame::{encode_frame, read_frame, write_blob, write_encoded, MAX_BLOB_SIZE};
use crate::protocol::{Failure, Message, Op, Outcome, RequestId};

/// State shared by every connection
struct Shared {
    store: Arc<RoomStore>,
    broadcaster: Arc<Broadcaster>,
    audio_dir: PathBuf,
}

/// Room server handle
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start serving `store` on the given port (0 picks a free one).
    ///
    /// `broadcaster` must be the observer attached to `store`; track bytes
    /// are read from `audio_dir`.
    pub async fn start(
        port: u16,
        store: Arc<RoomStore>,
        broadcaster: Arc<Broadcaster>,
        audio_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, rooms = store.rooms().len(), "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            store,
            broadcaster,
            audio_dir: audio_dir.as_ref().to_path_buf(),
        });

        tokio::spawn(accept_loop(listener, shared, shutdown_tx.clone()));

        Ok(Server {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown_tx: broadcast::Sender<()>) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            shared.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Identity established by the handshake
struct Peer {
    room: RoomCode,
    client: String,
    subscription: Option<SubscriptionId>,
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(writer_task(writer, rx));
    let closer = Arc::new(Notify::new());

    let peer = match handshake(&mut reader, &shared, &tx, &closer).await {
        Ok(peer) => peer,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            if let Error::Rejected(reason) = e {
                queue(&tx, &Message::Rejected { reason });
            }
            // Let the writer flush the rejection before the socket drops
            drop(tx);
            let _ = writer_handle.await;
            return;
        }
    };

    info!(
        addr = %addr,
        room = %peer.room,
        client = %peer.client,
        live = peer.subscription.is_some(),
        "Participant connected"
    );

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(Message::Request { id, op }) => {
                        handle_request(&shared, &peer, &tx, id, op).await;
                    }
                    Ok(_) => {
                        debug!(client = %peer.client, "Ignoring unexpected message type");
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!(client = %peer.client, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(client = %peer.client, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = closer.notified() => {
                debug!(client = %peer.client, "Connection superseded or evicted");
                break;
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    if let Some(id) = peer.subscription {
        let broadcaster = &shared.broadcaster;
        let released = shared.store.disconnect_when(&peer.room, &peer.client, || {
            broadcaster.unsubscribe(&peer.room, &peer.client, id)
        });
        if let Err(e) = released {
            warn!(room = %peer.room, client = %peer.client, error = %e, "Failed to record disconnect");
        }
    }
    writer_handle.abort();

    info!(room = %peer.room, client = %peer.client, "Participant disconnected");
}

/// Read the `Hello`, record the participant and send the `Welcome`.
///
/// The welcome snapshot is queued and the subscription registered while the
/// room is held, so no accepted state or disconnect can fall between them.
async fn handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
    shared: &Shared,
    tx: &mpsc::UnboundedSender<Outbound>,
    closer: &Arc<Notify>,
) -> Result<Peer> {
    let Message::Hello {
        room,
        client,
        subscribe,
    } = read_frame(reader).await?
    else {
        return Err(Error::Protocol("Expected Hello".into()));
    };

    if client.trim().is_empty() {
        return Err(Error::Rejected("Empty participant name".into()));
    }

    // Queue the welcome and register the subscription in the same step that
    // sets the live flag
    let (_, subscription) = shared
        .store
        .join_with(&room, &client, subscribe, |snapshot| -> Result<Option<SubscriptionId>> {
            let welcome = encode_frame(&Message::Welcome {
                snapshot: Box::new(snapshot.clone()),
            })?;
            let _ = tx.send(Outbound::Frame(welcome.into()));
            Ok(subscribe.then(|| {
                shared
                    .broadcaster
                    .subscribe(&room, &client, tx.clone(), closer.clone())
            }))
        })
        .map_err(|e| Error::Rejected(e.to_string()))?;

    let subscription = match subscription {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(room = %room, client = %client, error = %e, "Could not encode room state");
            if subscribe {
                if let Err(e) = shared.store.disconnect(&room, &client) {
                    warn!(room = %room, client = %client, error = %e, "Failed to record disconnect");
                }
            }
            return Err(Error::Rejected(format!("Room state could not be sent: {}", e)));
        }
    };

    Ok(Peer {
        room,
        client,
        subscription,
    })
}

fn queue(tx: &mpsc::UnboundedSender<Outbound>, msg: &Message) {
    match encode_frame(msg) {
        Ok(frame) => {
            let _ = tx.send(Outbound::Frame(frame.into()));
        }
        Err(e) => error!(error = %e, "Failed to encode message"),
    }
}

fn reply(tx: &mpsc::UnboundedSender<Outbound>, id: RequestId, outcome: Outcome) {
    queue(tx, &Message::Reply { id, outcome });
}

/// Map a store error onto the wire taxonomy
fn failure_for(error: unison_core::Error) -> Failure {
    match error {
        unison_core::Error::Conflict { current } => Failure::Conflict { snapshot: current },
        e if e.is_not_found() => Failure::NotFound {
            what: e.to_string(),
        },
        e @ unison_core::Error::NotHead { .. } => Failure::BadRequest {
            reason: e.to_string(),
        },
        e => {
            error!(error = %e, "Request failed on the server");
            Failure::Internal {
                reason: e.to_string(),
            }
        }
    }
}

fn failed(failure: Failure) -> Outcome {
    Outcome::Failed { failure }
}

async fn handle_request(
    shared: &Shared,
    peer: &Peer,
    tx: &mpsc::UnboundedSender<Outbound>,
    id: RequestId,
    op: Op,
) {
    let store = &shared.store;
    let outcome = match op {
        Op::Snapshot => match store.read(&peer.room) {
            Ok(snapshot) => Outcome::Snapshot {
                snapshot: Box::new(snapshot),
            },
            Err(e) => failed(failure_for(e)),
        },
        Op::Time => Outcome::Time { now: wall_clock() },
        Op::Heartbeat => match store.heartbeat(&peer.room, &peer.client) {
            Ok(evicted) => {
                for name in evicted {
                    shared.broadcaster.drop_client(&peer.room, &name);
                }
                Outcome::Ok
            }
            Err(e) => failed(failure_for(e)),
        },
        Op::ReportPossession { track } => {
            match store.report_possession(&peer.room, &peer.client, &track) {
                Ok(_) => Outcome::Ok,
                Err(e) => failed(failure_for(e)),
            }
        }
        Op::Control {
            expected_version,
            action,
        } => match store.control(&peer.room, expected_version, &action) {
            Ok(snapshot) => Outcome::Snapshot {
                snapshot: Box::new(snapshot),
            },
            Err(e) => failed(failure_for(e)),
        },
        Op::FetchTrack { track } => match read_track(shared, &track).await {
            Ok(bytes) => {
                let header = Message::Reply {
                    id,
                    outcome: Outcome::TrackFollows {
                        track: track.clone(),
                        len: bytes.len() as u64,
                    },
                };
                match encode_frame(&header) {
                    Ok(header) => {
                        debug!(client = %peer.client, track = %track, size = bytes.len(), "Serving track");
                        let _ = tx.send(Outbound::Track {
                            header: header.into(),
                            bytes: bytes.into(),
                        });
                        return;
                    }
                    Err(e) => failed(Failure::Internal {
                        reason: e.to_string(),
                    }),
                }
            }
            Err(failure) => failed(failure),
        },
    };
    reply(tx, id, outcome);
}

/// Read the bytes of an indexed track from the audio directory
async fn read_track(shared: &Shared, track: &TrackId) -> std::result::Result<Vec<u8>, Failure> {
    let Some(entry) = shared.store.index().get(track) else {
        return Err(Failure::NotFound {
            what: format!("track {}", track),
        });
    };
    if entry.size > MAX_BLOB_SIZE as u64 {
        return Err(Failure::BadRequest {
            reason: format!("track {} is too large to send", track),
        });
    }
    let path = shared.audio_dir.join(&entry.file_name);
    tokio::fs::read(&path).await.map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to read track");
        if e.kind() == std::io::ErrorKind::NotFound {
            Failure::NotFound {
                what: format!("track {}", track),
            }
        } else {
            Failure::Internal {
                reason: e.to_string(),
            }
        }
    })
}

/// Writer task - sends queued frames to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        let result = match out {
            Outbound::Frame(frame) => write_encoded(&mut writer, &frame).await,
            Outbound::Track { header, bytes } => match write_encoded(&mut writer, &header).await {
                Ok(()) => write_blob(&mut writer, &bytes).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}
