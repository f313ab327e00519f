//! In-process collaborators
//!
//! [`Switchboard`] stands in for the signaling intermediary and
//! [`LoopbackMediaEngine`] for the media stack, so two [`Phone`](crate::Phone)s
//! in one process can call each other. Both are deterministic and support
//! fault injection.

mod media;
mod switchboard;

pub use media::{
    encode_tracks, parse_tracks, LoopbackMediaEngine, LoopbackMediaSession, MediaBehavior, MediaStats,
};
pub use switchboard::{LoopbackSignaling, SessionPhase, SignalingOp, SignalingRecord, Switchboard};
