//! Error types for the phone core
//!
//! Errors are split by the layer that produces them:
//!
//! - [`SignalingError`] and [`MediaError`] are returned by the collaborator
//!   traits in [`crate::signaling`] and [`crate::media`].
//! - [`CallError`] is the descriptor a [`Call`](crate::Call) carries in its
//!   `error` event and returns from its async operations. It is `Clone` so it
//!   can travel through broadcast channels.
//! - [`PhoneError`] covers registration and configuration failures.

use thiserror::Error;

use crate::events::CallEventKind;

/// Result type for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Result type for phone operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Failure reported by a [`SignalingChannel`](crate::SignalingChannel)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// The dial target is not an addressable party
    #[error("cannot resolve target `{0}`")]
    Unresolvable(String),

    /// The intermediary refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session id is unknown to the intermediary
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The local endpoint is not registered with the channel
    #[error("endpoint not registered")]
    NotRegistered,

    /// The channel is gone
    #[error("signaling channel closed")]
    ChannelClosed,
}

/// Failure reported by a [`MediaSession`](crate::MediaSession)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// Local capture could not be started
    #[error("local media acquisition failed: {0}")]
    Acquisition(String),

    /// Offer/answer exchange failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The session was already released
    #[error("media session released")]
    Released,
}

/// Error descriptor for a single call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Dial target could not be resolved to an addressable party
    #[error("cannot resolve dial target `{target}`")]
    Resolution { target: String },

    /// Media acquisition or offer/answer exchange failed
    #[error("media negotiation failed: {0}")]
    Negotiation(String),

    /// The signaling channel rejected or failed a control request
    #[error("signaling failed: {0}")]
    Signaling(String),

    /// The call ended while the operation was still pending
    #[error("call ended before {operation} completed")]
    Cancelled { operation: &'static str },

    /// The operation does not apply to the call in its current state
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// The call reached a terminal state without emitting the awaited event
    #[error("call ended without a {0} event")]
    EventNeverFired(CallEventKind),
}

impl CallError {
    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Whether the error came from the call ending underneath the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Unresolvable(target) => Self::Resolution { target },
            other => Self::Signaling(other.to_string()),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        Self::Negotiation(err.to_string())
    }
}

/// Errors raised by [`Phone`](crate::Phone)
#[derive(Debug, Error)]
pub enum PhoneError {
    /// `dial` attempted while the phone is not registered
    #[error("phone is not registered")]
    NotRegistered,

    /// Registration with the signaling channel failed
    #[error("registration failed: {0}")]
    Registration(#[source] SignalingError),

    /// Deregistration with the signaling channel failed
    #[error("deregistration failed: {0}")]
    Deregistration(#[source] SignalingError),

    /// Operation not allowed in the current registration state
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The phone event stream closed
    #[error("phone event stream closed")]
    EventsClosed,
}

impl PhoneError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}
