//! In-process signaling intermediary

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SignalingError;
use crate::signaling::{NotificationStream, OfferReceipt, SignalingChannel, SignalingEvent, SignalingNotification};
use crate::types::{AnswerPayload, OfferPayload, Participant, SessionId};

/// Signaling requests, as recorded by the switchboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingOp {
    Register,
    Deregister,
    Offer,
    Acknowledge,
    Accept,
    Decline,
    Leave,
}

impl fmt::Display for SignalingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingOp::Register => "register",
            SignalingOp::Deregister => "deregister",
            SignalingOp::Offer => "offer",
            SignalingOp::Acknowledge => "acknowledge",
            SignalingOp::Accept => "accept",
            SignalingOp::Decline => "decline",
            SignalingOp::Leave => "leave",
        };
        write!(f, "{}", name)
    }
}

/// One request seen by the switchboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingRecord {
    pub op: SignalingOp,
    pub session_id: Option<SessionId>,
    /// Person that issued the request
    pub sender: String,
}

/// Lifecycle of a session on the switchboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Offered,
    Accepted,
    Ended,
}

struct Endpoint {
    participant: Participant,
    sender: mpsc::UnboundedSender<SignalingNotification>,
}

struct SessionRecord {
    caller: String,
    callee: String,
    phase: SessionPhase,
}

impl SessionRecord {
    fn peer_of(&self, person: &str) -> Option<&str> {
        if person == self.caller {
            Some(&self.callee)
        } else if person == self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct SwitchboardInner {
    endpoints: DashMap<String, Endpoint>,
    sessions: DashMap<SessionId, SessionRecord>,
    records: Mutex<Vec<SignalingRecord>>,
    faults: Mutex<HashMap<SignalingOp, SignalingError>>,
}

/// Routes signaling between endpoints registered in the same process
///
/// Endpoints are addressed by identity or by address. Every request is
/// recorded, and [`fail_next`](Self::fail_next) makes the next request of a
/// given kind fail.
#[derive(Clone, Default)]
pub struct Switchboard {
    inner: Arc<SwitchboardInner>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signaling channel attached to this switchboard
    pub fn endpoint(&self) -> Arc<LoopbackSignaling> {
        Arc::new(LoopbackSignaling {
            board: self.clone(),
            local: Mutex::new(None),
        })
    }

    /// Make the next `op` request fail with `error`
    pub fn fail_next(&self, op: SignalingOp, error: SignalingError) {
        self.inner.faults.lock().insert(op, error);
    }

    /// Requests seen so far, oldest first
    pub fn records(&self) -> Vec<SignalingRecord> {
        self.inner.records.lock().clone()
    }

    /// Number of `op` requests seen so far
    pub fn count(&self, op: SignalingOp) -> usize {
        self.inner.records.lock().iter().filter(|r| r.op == op).count()
    }

    /// Number of `op` requests seen for `session`
    pub fn count_for(&self, op: SignalingOp, session: &SessionId) -> usize {
        self.inner
            .records
            .lock()
            .iter()
            .filter(|r| r.op == op && r.session_id.as_ref() == Some(session))
            .count()
    }

    pub fn session_phase(&self, session: &SessionId) -> Option<SessionPhase> {
        self.inner.sessions.get(session).map(|s| s.phase)
    }

    pub fn is_registered(&self, person: &str) -> bool {
        self.inner.endpoints.contains_key(person)
    }

    /// Record the request, then apply any pending fault for it
    fn admit(&self, op: SignalingOp, session_id: Option<&SessionId>, sender: &str) -> Result<(), SignalingError> {
        self.inner.records.lock().push(SignalingRecord {
            op,
            session_id: session_id.cloned(),
            sender: sender.to_string(),
        });
        match self.inner.faults.lock().remove(&op) {
            Some(error) => {
                debug!("Injected {} failure: {}", op, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn resolve(&self, target: &Participant) -> Option<Participant> {
        if let Some(endpoint) = self.inner.endpoints.get(&target.person) {
            return Some(endpoint.participant.clone());
        }
        self.inner
            .endpoints
            .iter()
            .find(|e| e.participant.address == target.address || e.participant.person == target.address)
            .map(|e| e.participant.clone())
    }

    fn push(&self, person: &str, session_id: &SessionId, event: SignalingEvent) {
        match self.inner.endpoints.get(person) {
            Some(endpoint) => {
                let name = event.name();
                if endpoint
                    .sender
                    .send(SignalingNotification::new(session_id.clone(), event))
                    .is_err()
                {
                    debug!("Endpoint {} stopped listening, dropped {}", person, name);
                }
            }
            None => debug!("Endpoint {} is not registered, dropped {}", person, event.name()),
        }
    }

    /// Move `session` from `from` to `to` and return the peer of `sender`
    fn advance(
        &self,
        session: &SessionId,
        sender: &str,
        from: &[SessionPhase],
        to: SessionPhase,
    ) -> Result<String, SignalingError> {
        let mut record = self
            .inner
            .sessions
            .get_mut(session)
            .ok_or_else(|| SignalingError::UnknownSession(session.to_string()))?;
        let peer = record
            .peer_of(sender)
            .map(str::to_string)
            .ok_or_else(|| SignalingError::Rejected(format!("{} is not part of session {}", sender, session)))?;
        if !from.contains(&record.phase) {
            return Err(SignalingError::Rejected(format!(
                "session {} is {:?}",
                session, record.phase
            )));
        }
        record.phase = to;
        Ok(peer)
    }
}

/// [`SignalingChannel`] backed by a [`Switchboard`]
pub struct LoopbackSignaling {
    board: Switchboard,
    local: Mutex<Option<Participant>>,
}

impl LoopbackSignaling {
    pub fn switchboard(&self) -> &Switchboard {
        &self.board
    }

    fn local_person(&self) -> Result<String, SignalingError> {
        self.local
            .lock()
            .as_ref()
            .map(|p| p.person.clone())
            .ok_or(SignalingError::NotRegistered)
    }
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    async fn register(&self, local: &Participant) -> Result<NotificationStream, SignalingError> {
        self.board.admit(SignalingOp::Register, None, &local.person)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.board.inner.endpoints.insert(
            local.person.clone(),
            Endpoint {
                participant: local.clone(),
                sender,
            },
        );
        *self.local.lock() = Some(local.clone());
        debug!("Switchboard registered {}", local);
        Ok(receiver)
    }

    async fn deregister(&self, local: &Participant) -> Result<(), SignalingError> {
        self.board.admit(SignalingOp::Deregister, None, &local.person)?;
        self.board.inner.endpoints.remove(&local.person);
        Ok(())
    }

    async fn send_offer(
        &self,
        from: &Participant,
        target: &Participant,
        offer: OfferPayload,
    ) -> Result<OfferReceipt, SignalingError> {
        self.board.admit(SignalingOp::Offer, None, &from.person)?;

        let callee = self
            .board
            .resolve(target)
            .ok_or_else(|| SignalingError::Unresolvable(target.address.clone()))?;
        let caller = self
            .board
            .inner
            .endpoints
            .get(&from.person)
            .map(|e| e.participant.clone())
            .unwrap_or_else(|| from.clone());

        let session = SessionId::random();
        self.board.inner.sessions.insert(
            session.clone(),
            SessionRecord {
                caller: caller.person.clone(),
                callee: callee.person.clone(),
                phase: SessionPhase::Offered,
            },
        );
        self.board.push(
            &callee.person,
            &session,
            SignalingEvent::Offer {
                from: caller,
                offer,
            },
        );
        Ok(OfferReceipt::new(session, callee))
    }

    async fn acknowledge(&self, session: &SessionId) -> Result<(), SignalingError> {
        let sender = self.local_person()?;
        self.board.admit(SignalingOp::Acknowledge, Some(session), &sender)?;
        let peer = self
            .board
            .advance(session, &sender, &[SessionPhase::Offered], SessionPhase::Offered)?;
        self.board.push(&peer, session, SignalingEvent::Acknowledged);
        Ok(())
    }

    async fn accept(&self, session: &SessionId, answer: AnswerPayload) -> Result<(), SignalingError> {
        let sender = self.local_person()?;
        self.board.admit(SignalingOp::Accept, Some(session), &sender)?;
        let peer = self
            .board
            .advance(session, &sender, &[SessionPhase::Offered], SessionPhase::Accepted)?;
        self.board.push(&peer, session, SignalingEvent::Answered(answer));
        Ok(())
    }

    async fn decline(&self, session: &SessionId) -> Result<(), SignalingError> {
        let sender = self.local_person()?;
        self.board.admit(SignalingOp::Decline, Some(session), &sender)?;
        let peer = self
            .board
            .advance(session, &sender, &[SessionPhase::Offered], SessionPhase::Ended)?;
        self.board.push(&peer, session, SignalingEvent::Declined);
        Ok(())
    }

    async fn leave(&self, session: &SessionId) -> Result<(), SignalingError> {
        let sender = self.local_person()?;
        self.board.admit(SignalingOp::Leave, Some(session), &sender)?;
        if self.board.session_phase(session) == Some(SessionPhase::Ended) {
            // The peer already left or declined
            return Ok(());
        }
        let peer = self.board.advance(
            session,
            &sender,
            &[SessionPhase::Offered, SessionPhase::Accepted],
            SessionPhase::Ended,
        )?;
        self.board.push(&peer, session, SignalingEvent::Left);
        Ok(())
    }
}
