//! Data models for Unison

mod room;
mod snapshot;
mod track;

pub use room::*;
pub use snapshot::*;
pub use track::*;
