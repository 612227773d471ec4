//! Unison Core Library
//!
//! Room state, the rendezvous barrier, clock estimation, playback
//! convergence and the local track cache for synchronized playback.

pub mod barrier;
pub mod cache;
pub mod clock;
pub mod control;
pub mod error;
pub mod invariants;
pub mod models;
pub mod playback;
pub mod store;

pub use cache::BlobStore;
pub use clock::{wall_clock, ClockEstimate, ClockEstimator, ClockSample};
pub use control::Action;
pub use error::{Error, Result};
pub use models::*;
pub use playback::{ClockedPlayer, ConvergenceController, Correction, PlayableTrack, Player, Verdict};
pub use store::{RoomStore, StateObserver};
