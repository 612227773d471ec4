//! TCP client for a room server
//!
//! A [`Client`] is a cheap, cloneable handle. One task reads frames and
//! routes replies to their waiting requests; another writes queued
//! requests. Pushed snapshots replace the local snapshot in stream order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use unison_core::{version_is_newer, Action, RoomCode, Snapshot, TrackId};

use crate::error::{Error, Result};
use crate::frame::{read_blob, read_frame, write_frame};
use crate::protocol::{Failure, Message, Op, Outcome, RequestId};

/// Notice shown after a rejected control request
pub const OUT_OF_SYNC_NOTICE: &str = "Out of sync; refreshed";

/// Event for the user interface
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transient, user-visible message
    Notice(String),
    /// The local track cache failed and has been switched off
    CacheDisabled(String),
    /// Connection lost
    Disconnected,
}

enum Response {
    Outcome(Outcome),
    Track { track: TrackId, bytes: Vec<u8> },
}

enum Outgoing {
    Send(Message),
    Close,
}

/// Requests awaiting a reply. Once `closed`, no reply can arrive.
#[derive(Default)]
struct Waiters {
    waiting: HashMap<RequestId, oneshot::Sender<Response>>,
    closed: bool,
}

type Pending = Mutex<Waiters>;

struct Inner {
    room: RoomCode,
    name: String,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    snapshot: Arc<watch::Sender<Arc<Snapshot>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Client handle for network operations
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connect to a room server and join `room` as `name`, opening the
    /// participant's push subscription
    pub async fn connect(
        addr: SocketAddr,
        room: RoomCode,
        name: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let name = name.into();
        info!(addr = %addr, room = %room, name = %name, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(
            &mut writer,
            &Message::Hello {
                room: room.clone(),
                client: name.clone(),
                subscribe: true,
            },
        )
        .await?;

        let welcome = match read_frame(&mut reader).await? {
            Message::Welcome { snapshot } => Arc::new(*snapshot),
            Message::Rejected { reason } => {
                warn!(reason = %reason, "Join rejected");
                return Err(Error::Rejected(reason));
            }
            _ => return Err(Error::Protocol("Expected Welcome".into())),
        };
        info!(
            room = %room,
            version = welcome.version(),
            tracks = welcome.index.len(),
            "Joined room"
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(welcome);
        let snapshot = Arc::new(snapshot);
        let pending: Arc<Pending> = Arc::default();

        tokio::spawn(writer_task(writer, out_rx));
        tokio::spawn(reader_task(
            reader,
            pending.clone(),
            snapshot.clone(),
            events_tx.clone(),
        ));

        let client = Client {
            inner: Arc::new(Inner {
                room,
                name,
                out_tx,
                pending,
                next_id: AtomicU64::new(1),
                snapshot,
                events: events_tx,
            }),
        };
        Ok((client, events_rx))
    }

    pub fn room(&self) -> &RoomCode {
        &self.inner.room
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Latest snapshot seen on this connection
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch for snapshot replacements
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Sender for user-visible events on this client's event stream
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.inner.events.clone()
    }

    fn notice(&self, text: impl Into<String>) {
        let _ = self.inner.events.send(ClientEvent::Notice(text.into()));
    }

    async fn request(&self, op: Op) -> Result<Response> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                return Err(Error::NotConnected);
            }
            pending.waiting.insert(id, tx);
        }

        if self
            .inner
            .out_tx
            .send(Outgoing::Send(Message::Request { id, op }))
            .is_err()
        {
            lock(&self.inner.pending).waiting.remove(&id);
            return Err(Error::NotConnected);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    async fn outcome(&self, op: Op) -> Result<Outcome> {
        match self.request(op).await? {
            Response::Outcome(Outcome::Failed { failure }) => Err(failure_error(failure)),
            Response::Outcome(outcome) => Ok(outcome),
            Response::Track { .. } => Err(Error::Protocol("Unexpected track payload".into())),
        }
    }

    /// Fetch the full room state, replacing the local snapshot if newer
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        match self.outcome(Op::Snapshot).await? {
            Outcome::Snapshot { .. } => Ok(self.snapshot()),
            other => Err(unexpected(&other)),
        }
    }

    /// Server wall clock as reported by the time endpoint
    pub async fn server_time(&self) -> Result<f64> {
        match self.outcome(Op::Time).await? {
            Outcome::Time { now } => Ok(now),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.outcome(Op::Heartbeat).await.map(|_| ())
    }

    /// Tell the server this client holds `track` locally
    pub async fn report_possession(&self, track: &TrackId) -> Result<()> {
        self.outcome(Op::ReportPossession {
            track: track.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Download a track's bytes
    pub async fn fetch_track(&self, track: &TrackId) -> Result<Vec<u8>> {
        let response = self
            .request(Op::FetchTrack {
                track: track.clone(),
            })
            .await?;
        match response {
            Response::Track { track: got, bytes } if &got == track => Ok(bytes),
            Response::Track { track: got, .. } => Err(Error::Protocol(format!(
                "Asked for track {} but received {}",
                track, got
            ))),
            Response::Outcome(Outcome::Failed { failure }) => Err(failure_error(failure)),
            Response::Outcome(other) => Err(unexpected(&other)),
        }
    }

    /// Submit a control action against an explicit last-seen version.
    ///
    /// A conflict has already replaced the local snapshot with the server's
    /// when this returns; the intent is not retried.
    pub async fn control_at(&self, expected_version: u32, action: Action) -> Result<Arc<Snapshot>> {
        let outcome = self
            .outcome(Op::Control {
                expected_version,
                action,
            })
            .await?;
        match outcome {
            Outcome::Snapshot { .. } => Ok(self.snapshot()),
            other => Err(unexpected(&other)),
        }
    }

    /// Submit a user control action against the latest snapshot's version.
    /// On conflict the user is told the view was refreshed.
    pub async fn control(&self, action: Action) -> Result<Arc<Snapshot>> {
        let version = self.snapshot().version();
        let result = self.control_at(version, action).await;
        if let Err(Error::Conflict(_)) = &result {
            self.notice(OUT_OF_SYNC_NOTICE);
        }
        result
    }

    /// Close the connection; the server clears this participant's live flag
    pub fn disconnect(&self) {
        let _ = self.inner.out_tx.send(Outgoing::Close);
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, Waiters> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failure_error(failure: Failure) -> Error {
    match failure {
        Failure::Conflict { snapshot } => Error::Conflict(snapshot),
        Failure::NotFound { what } => Error::NotFound(what),
        Failure::BadRequest { reason } | Failure::Internal { reason } => {
            Error::Protocol(format!("Server refused request: {}", reason))
        }
    }
}

fn unexpected(outcome: &Outcome) -> Error {
    Error::Protocol(format!("Unexpected reply: {:?}", outcome))
}

/// Replace the local snapshot if `incoming` is newer
fn apply_snapshot(current: &watch::Sender<Arc<Snapshot>>, incoming: &Snapshot) {
    current.send_if_modified(|held| {
        if version_is_newer(incoming.version(), held.version()) {
            debug!(from = held.version(), to = incoming.version(), "Applied snapshot");
            *held = Arc::new(incoming.clone());
            true
        } else {
            false
        }
    });
}

/// Writer task - sends queued requests to the server
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Send(msg) => {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }
            Outgoing::Close => {
                debug!("Disconnect requested");
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

/// Reader task - routes replies and applies pushed snapshots
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    pending: Arc<Pending>,
    snapshot: Arc<watch::Sender<Arc<Snapshot>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        let msg = match read_frame(&mut reader).await {
            Ok(msg) => msg,
            Err(Error::ConnectionClosed) => {
                debug!("Server closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                break;
            }
        };

        match msg {
            Message::Snapshot { snapshot: pushed } => apply_snapshot(&snapshot, &pushed),
            Message::Reply { id, outcome } => {
                let response = match outcome {
                    Outcome::TrackFollows { track, len } => match read_blob(&mut reader).await {
                        Ok(bytes) if bytes.len() as u64 == len => Response::Track { track, bytes },
                        Ok(bytes) => {
                            warn!(expected = len, got = bytes.len(), "Track length mismatch");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read track bytes");
                            break;
                        }
                    },
                    outcome => {
                        match &outcome {
                            Outcome::Snapshot { snapshot: fresh }
                            | Outcome::Failed {
                                failure: Failure::Conflict { snapshot: fresh },
                            } => apply_snapshot(&snapshot, fresh),
                            _ => {}
                        }
                        Response::Outcome(outcome)
                    }
                };
                let waiter = lock(&pending).waiting.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(id, "Reply for unknown request"),
                }
            }
            _ => debug!("Ignoring unexpected message"),
        }
    }

    // Dropping the waiters fails every outstanding request
    {
        let mut pending = lock(&pending);
        pending.closed = true;
        pending.waiting.clear();
    }
    let _ = events.send(ClientEvent::Disconnected);
    info!("Disconnected from server");
}
