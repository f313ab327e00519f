//! Media session abstraction
//!
//! A [`MediaSession`] owns the local capture and the offer/answer exchange
//! for one call. The payloads it produces are opaque to the call state
//! machine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaError;
use crate::types::{AnswerPayload, CallId, LocalStream, MediaConstraints, OfferPayload, RemoteStream};

/// Result of answering a remote offer
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedAnswer {
    pub answer: AnswerPayload,
    pub remote_stream: RemoteStream,
}

/// Media for a single call
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Start local capture
    async fn acquire_local(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Build an offer from the acquired local stream
    async fn create_offer(&self) -> Result<OfferPayload, MediaError>;

    /// Apply the remote answer to an offer this session created
    async fn apply_remote_answer(&self, answer: &AnswerPayload) -> Result<RemoteStream, MediaError>;

    /// Answer a remote offer with the acquired local stream
    async fn create_answer(&self, offer: &OfferPayload) -> Result<NegotiatedAnswer, MediaError>;

    /// Swap the outgoing tracks without renegotiating topology
    async fn replace_local_track(&self, stream: &LocalStream) -> Result<(), MediaError>;

    /// Stop capture and tear down the session. Must be idempotent.
    async fn release(&self);
}

/// Vends one [`MediaSession`] per call
pub trait MediaSessionFactory: Send + Sync {
    fn create_session(&self, call_id: &CallId) -> Arc<dyn MediaSession>;
}
