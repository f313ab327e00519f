//! # Duplex phone core
//!
//! Call control for two-party audio/video sessions. A [`Phone`] registers
//! with a [`SignalingChannel`], places calls with [`Phone::dial`] and
//! publishes inbound calls as [`PhoneEvent::IncomingCall`]. Each [`Call`] is
//! a state machine that reconciles signaling pushes, local actions and the
//! lifecycle of its [`MediaSession`]:
//!
//! ```text
//! initiated ──► ringing ──► connected ──► disconnected
//!     │            │            │
//!     └────────────┴────────────┴───────► error
//! ```
//!
//! Status only moves forward, and the terminal transition happens once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duplex_phone_core::loopback::{LoopbackMediaEngine, Switchboard};
//! use duplex_phone_core::{CallEventKind, Phone, PhoneConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = Switchboard::new();
//!     let media = Arc::new(LoopbackMediaEngine::new());
//!
//!     let alice = Phone::new(PhoneConfig::new("alice@example.com"), board.endpoint(), media.clone())?;
//!     let bob = Phone::new(PhoneConfig::new("bob@example.com"), board.endpoint(), media)?;
//!     alice.register().await?;
//!     bob.register().await?;
//!
//!     let incoming = bob.next_incoming();
//!     let call = alice.dial("bob@example.com", None)?;
//!     let connected = call.when(CallEventKind::Connected);
//!
//!     incoming.await?.answer().await?;
//!     connected.await?;
//!
//!     call.hangup().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Collaborators
//!
//! Signaling and media are traits ([`SignalingChannel`], [`MediaSession`],
//! [`MediaSessionFactory`]). The [`loopback`] module implements both in
//! process.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod loopback;
pub mod media;
pub mod phone;
pub mod registration;
pub mod signaling;
pub mod types;

// Re-export main types
pub use call::{Call, CallStatus, CallTrigger, InvalidTransition};
pub use config::PhoneConfig;
pub use error::{CallError, CallResult, MediaError, PhoneError, PhoneResult, SignalingError};
pub use events::{CallEvent, CallEventKind, EventEmitter, EventStream, PhoneEvent};
pub use logging::{setup_logging, LoggingConfig};
pub use media::{MediaSession, MediaSessionFactory, NegotiatedAnswer};
pub use phone::Phone;
pub use registration::RegistrationState;
pub use signaling::{NotificationStream, OfferReceipt, SignalingChannel, SignalingEvent, SignalingNotification};
pub use types::{
    AnswerPayload, CallDirection, CallId, DisconnectReason, FacingMode, LocalStream, MediaConstraints,
    MediaTracks, OfferPayload, Participant, RemoteStream, SessionId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
