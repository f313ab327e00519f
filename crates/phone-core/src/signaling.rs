//! Signaling channel abstraction
//!
//! The signaling intermediary carries call-control requests between two
//! registered endpoints. Requests go out through [`SignalingChannel`]; pushes
//! for the local endpoint come back on the [`NotificationStream`] returned by
//! [`SignalingChannel::register`], each tagged with the session it belongs to.
//!
//! Notifications for one session arrive in the order the remote actions
//! occurred. Nothing here guarantees an `Answered` before a `Left`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::types::{AnswerPayload, OfferPayload, Participant, SessionId};

/// Receiver side of a registration's push subscription
pub type NotificationStream = mpsc::UnboundedReceiver<SignalingNotification>;

/// A push delivered to a registered endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingNotification {
    pub session_id: SessionId,
    pub event: SignalingEvent,
}

impl SignalingNotification {
    pub fn new(session_id: SessionId, event: SignalingEvent) -> Self {
        Self { session_id, event }
    }
}

/// Result of a successful offer
///
/// `callee` is the party the intermediary resolved the dial target to, which
/// may differ from the target as dialed (for example an address rather than
/// an identity).
#[derive(Debug, Clone, PartialEq)]
pub struct OfferReceipt {
    pub session_id: SessionId,
    pub callee: Participant,
}

impl OfferReceipt {
    pub fn new(session_id: SessionId, callee: Participant) -> Self {
        Self { session_id, callee }
    }
}

/// Call-control pushes
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A remote party offers a new call
    Offer {
        from: Participant,
        offer: OfferPayload,
    },
    /// The remote device is alerting
    Acknowledged,
    /// The remote party answered
    Answered(AnswerPayload),
    /// The remote party declined before answering
    Declined,
    /// The remote party left the session
    Left,
}

impl SignalingEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::Offer { .. } => "offer",
            SignalingEvent::Acknowledged => "acknowledged",
            SignalingEvent::Answered(_) => "answered",
            SignalingEvent::Declined => "declined",
            SignalingEvent::Left => "left",
        }
    }
}

/// Call-control transport used by [`Phone`](crate::Phone) and [`Call`](crate::Call)
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Register the local endpoint and open its push subscription
    async fn register(&self, local: &Participant) -> Result<NotificationStream, SignalingError>;

    /// Tear down the push subscription for the local endpoint
    async fn deregister(&self, local: &Participant) -> Result<(), SignalingError>;

    /// Offer a new call to `target`, returning the session id the
    /// intermediary assigned to the conversation and the resolved callee
    async fn send_offer(
        &self,
        from: &Participant,
        target: &Participant,
        offer: OfferPayload,
    ) -> Result<OfferReceipt, SignalingError>;

    /// Tell the caller the local device is alerting
    async fn acknowledge(&self, session: &SessionId) -> Result<(), SignalingError>;

    /// Accept an offered call
    async fn accept(&self, session: &SessionId, answer: AnswerPayload) -> Result<(), SignalingError>;

    /// Decline an offered call
    async fn decline(&self, session: &SessionId) -> Result<(), SignalingError>;

    /// Leave the session
    async fn leave(&self, session: &SessionId) -> Result<(), SignalingError>;
}
