//! Unison Network Library
//!
//! TCP transport for shared listening rooms.
//!
//! # Architecture
//!
//! - **Server**: Serves rooms from a [`unison_core::RoomStore`], answers
//!   requests and pushes every accepted state to subscribed participants
//! - **Client**: Connects to a server, keeps the latest snapshot and issues
//!   guarded control requests
//! - **Session**: A client plus the clock sync, convergence, prefetch and
//!   heartbeat tasks that keep a local player in step with the room
//! - **Protocol**: Length-prefixed JSON messages; track bytes follow as raw
//!   blob frames
//!
//! # Usage
//!
//! ```ignore
//! // Serve a library
//! let broadcaster = Arc::new(Broadcaster::new());
//! let store = RoomStore::open(state_dir, TrackIndex::scan_dir(audio_dir)?)?
//!     .with_observer(broadcaster.clone());
//! let server = Server::start(DEFAULT_PORT, Arc::new(store), broadcaster, audio_dir).await?;
//!
//! // Listen along
//! let player: SharedPlayer = Arc::new(Mutex::new(ClockedPlayer::new()));
//! let (session, mut events) = Session::start(addr, room, "alice", player, Some(&cache)).await?;
//! session.client().control(Action::Play).await?;
//! ```

pub mod broadcast;
pub mod client;
pub mod clock_sync;
pub mod convergence;
pub mod error;
mod frame;
pub mod prefetch;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{Broadcaster, Outbound, SubscriptionId};
pub use client::{Client, ClientEvent, OUT_OF_SYNC_NOTICE};
pub use clock_sync::SharedClock;
pub use convergence::SharedPlayer;
pub use error::{Error, Result};
pub use prefetch::{PrefetchManager, TrackSource};
pub use protocol::{Failure, Message, Op, Outcome, RequestId};
pub use server::Server;
pub use session::{Session, HEARTBEAT_PERIOD};

/// Default port for Unison servers
pub const DEFAULT_PORT: u16 = 7341;
