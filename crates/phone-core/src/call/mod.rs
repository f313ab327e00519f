//! Two-party call state machine
//!
//! A [`Call`] binds one signaling conversation to one [`MediaSession`]. It is
//! a cheap handle: clones share the same call.
//!
//! Triggers reach a call from two directions:
//!
//! - Local methods ([`answer`](Call::answer), [`reject`](Call::reject),
//!   [`hangup`](Call::hangup), ...) apply their transition under a short
//!   lock. `hangup` and `reject` transition at invocation and then send
//!   their signaling request. `answer` transitions once negotiation and the
//!   signaling round-trip complete.
//! - Signaling pushes are queued per call and handled one at a time by the
//!   call's push worker, so they are applied in the order they arrived.
//!
//! Every transition emits its event while the lock is held, so subscribers
//! observe events in transition order. The terminal transition (into
//! `disconnected` or `error`) happens exactly once. It closes the event
//! stream, fires the call's cancellation token (aborting any pending media
//! or answer work), releases the media session and removes the call from
//! its phone.

mod state;

pub use state::{CallStatus, CallTrigger, InvalidTransition};

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, CallEventKind, EventEmitter, EventStream};
use crate::media::{MediaSession, MediaSessionFactory};
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::types::{
    AnswerPayload, CallDirection, CallId, DisconnectReason, FacingMode, LocalStream, MediaConstraints,
    MediaTracks, OfferPayload, Participant, RemoteStream, SessionId,
};

/// Hooks a call uses to keep its owner's routing table in sync
pub(crate) trait CallRegistry: Send + Sync {
    /// The signaling layer confirmed the session id of an outbound call
    fn bind_session(&self, session: &SessionId, call: &Call);

    /// The call reached a terminal status
    fn call_ended(&self, call: &Call);
}

/// Collaborators shared by every call a phone creates
#[derive(Clone)]
pub(crate) struct CallContext {
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: Arc<dyn MediaSessionFactory>,
    pub registry: Option<Weak<dyn CallRegistry>>,
    pub event_capacity: usize,
}

/// Which side initiated a leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaveOrigin {
    Local,
    Remote,
}

/// Mutable state of the local leg
struct LegState {
    status: CallStatus,
    to: Participant,
    session_id: Option<SessionId>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    facing_mode: FacingMode,
    remote_offer: Option<OfferPayload>,
    answering: bool,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    disconnect_reason: Option<DisconnectReason>,
    last_error: Option<CallError>,
}

struct CallInner {
    id: CallId,
    direction: CallDirection,
    from: Participant,
    constraints: MediaConstraints,
    created_at: DateTime<Utc>,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaSession>,
    registry: Option<Weak<dyn CallRegistry>>,
    state: Mutex<LegState>,
    events: EventEmitter<CallEvent>,
    pushes: mpsc::UnboundedSender<SignalingEvent>,
    cancel: CancellationToken,
}

/// Handle to a single two-party call
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    fn new(
        ctx: &CallContext,
        direction: CallDirection,
        from: Participant,
        to: Participant,
        constraints: MediaConstraints,
        session_id: Option<SessionId>,
        remote_offer: Option<OfferPayload>,
    ) -> Self {
        let id = CallId::new();
        let (pushes, push_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner = Arc::new(CallInner {
            id,
            direction,
            from,
            constraints,
            created_at: Utc::now(),
            signaling: ctx.signaling.clone(),
            media: ctx.media.create_session(&id),
            registry: ctx.registry.clone(),
            state: Mutex::new(LegState {
                status: CallStatus::Initiated,
                to,
                session_id,
                local_stream: None,
                remote_stream: None,
                facing_mode: constraints.facing_mode,
                remote_offer,
                answering: false,
                connected_at: None,
                ended_at: None,
                disconnect_reason: None,
                last_error: None,
            }),
            events: EventEmitter::new(ctx.event_capacity),
            pushes,
            cancel: cancel.clone(),
        });

        tokio::spawn(run_push_worker(Arc::downgrade(&inner), push_rx, cancel));

        Self { inner }
    }

    /// Create an outbound call and start dialing in the background
    pub(crate) fn outbound(
        ctx: &CallContext,
        from: Participant,
        to: Participant,
        constraints: MediaConstraints,
    ) -> Self {
        let call = Self::new(ctx, CallDirection::Out, from, to, constraints, None, None);
        info!("Created outgoing call {} -> {} (call_id: {})", call.from(), call.to(), call.id());

        let task = call.clone();
        tokio::spawn(async move {
            if let Err(err) = task.run_dial().await {
                if err.is_cancelled() {
                    debug!("Dial for call {} abandoned: {}", task.id(), err);
                } else {
                    task.fail(err);
                }
            }
        });

        call
    }

    /// Create an inbound call for an offer received from `from`
    pub(crate) fn inbound(
        ctx: &CallContext,
        local: Participant,
        from: Participant,
        session: SessionId,
        offer: OfferPayload,
        constraints: MediaConstraints,
    ) -> Self {
        let call = Self::new(ctx, CallDirection::In, from, local, constraints, Some(session), Some(offer));
        info!("Created incoming call {} <- {} (call_id: {})", call.to(), call.from(), call.id());
        call
    }

    // ===== Accessors =====

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// Conversation id, once the signaling layer has confirmed it
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().session_id.clone()
    }

    pub fn status(&self) -> CallStatus {
        self.inner.state.lock().status
    }

    pub fn direction(&self) -> CallDirection {
        self.inner.direction
    }

    /// The callee. For outbound calls this is the dial target until the
    /// signaling layer resolves it, then the resolved party.
    pub fn to(&self) -> Participant {
        self.inner.state.lock().to.clone()
    }

    pub fn from(&self) -> &Participant {
        &self.inner.from
    }

    pub fn constraints(&self) -> MediaConstraints {
        self.inner.constraints
    }

    pub fn local_media_stream(&self) -> Option<LocalStream> {
        self.inner.state.lock().local_stream.clone()
    }

    /// Negotiated remote stream. `None` until the call connects and again
    /// once it has ended.
    pub fn remote_media_stream(&self) -> Option<RemoteStream> {
        self.inner.state.lock().remote_stream.clone()
    }

    pub fn sending_audio(&self) -> bool {
        self.local_tracks().audio
    }

    pub fn sending_video(&self) -> bool {
        self.local_tracks().video
    }

    pub fn receiving_audio(&self) -> bool {
        self.remote_tracks().audio
    }

    pub fn receiving_video(&self) -> bool {
        self.remote_tracks().video
    }

    /// Camera facing mode, only while a local video track exists
    pub fn facing_mode(&self) -> Option<FacingMode> {
        let state = self.inner.state.lock();
        match &state.local_stream {
            Some(stream) if stream.tracks.video => Some(state.facing_mode),
            _ => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().ended_at
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner.state.lock().disconnect_reason
    }

    /// Error that moved the call to `error`, if any
    pub fn last_error(&self) -> Option<CallError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Whether the call is neither disconnected nor failed
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    fn local_tracks(&self) -> MediaTracks {
        self.inner
            .state
            .lock()
            .local_stream
            .as_ref()
            .map(|stream| stream.tracks)
            .unwrap_or_default()
    }

    fn remote_tracks(&self) -> MediaTracks {
        self.inner
            .state
            .lock()
            .remote_stream
            .as_ref()
            .map(|stream| stream.tracks)
            .unwrap_or_default()
    }

    // ===== Events =====

    /// Subscribe to events that have not happened yet
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to events as a stream
    pub fn events(&self) -> EventStream<CallEvent> {
        self.inner.events.events()
    }

    /// Resolve on the next event of `kind`
    ///
    /// Fails with [`CallError::EventNeverFired`] if the call ends first.
    pub fn when(&self, kind: CallEventKind) -> impl Future<Output = CallResult<CallEvent>> + Send + 'static {
        let next = self.inner.events.next_matching(move |event| event.kind() == kind);
        async move { next.await.ok_or(CallError::EventNeverFired(kind)) }
    }

    // ===== Local operations =====

    /// Tell the caller this device is alerting
    ///
    /// No-op for outbound calls and once the call is answered or ended.
    pub async fn acknowledge(&self) -> CallResult<()> {
        if self.inner.direction == CallDirection::Out {
            return Ok(());
        }
        let session = {
            let state = self.inner.state.lock();
            if state.status != CallStatus::Initiated || state.answering {
                return Ok(());
            }
            state.session_id.clone()
        };
        let Some(session) = session else {
            return Ok(());
        };

        let result = self.inner.signaling.acknowledge(&session).await.map_err(CallError::from);
        self.surface(result)
    }

    /// Answer an inbound call
    ///
    /// Acquires local media, answers the remote offer and accepts the
    /// session. The call moves to `connected` once all of that succeeds. A
    /// no-op for outbound calls, for calls that are already answered or
    /// ended, and while another answer is in progress.
    pub async fn answer(&self) -> CallResult<()> {
        if self.inner.direction == CallDirection::Out {
            debug!("Ignoring answer on outgoing call {}", self.id());
            return Ok(());
        }
        let (session, offer) = {
            let mut state = self.inner.state.lock();
            if !state.status.is_pending() || state.answering {
                return Ok(());
            }
            let (Some(session), Some(offer)) = (state.session_id.clone(), state.remote_offer.clone()) else {
                return Err(CallError::invalid_state("incoming call has no offer to answer"));
            };
            state.answering = true;
            (session, offer)
        };

        let result = self.negotiate_answer(session, offer).await;
        if result.is_ok() {
            info!("Answered call {}", self.id());
        }
        self.surface(result)
    }

    /// Decline an inbound call
    ///
    /// The call moves to `disconnected` immediately. A no-op for outbound
    /// calls and once the call is answered or an answer is in progress.
    pub async fn reject(&self) -> CallResult<()> {
        self.reject_call().await.map(|_| ())
    }

    /// Hang up
    ///
    /// The call moves to `disconnected` immediately and a leave is sent.
    /// Calling it again, or after the call ended, does nothing. On an
    /// unanswered inbound call this declines instead.
    pub async fn hangup(&self) -> CallResult<()> {
        if self.unanswered_inbound() && self.reject_call().await? {
            return Ok(());
        }
        self.leave_call(LeaveOrigin::Local).await
    }

    /// Switch between the front and rear camera
    ///
    /// Swaps the local camera track without renegotiating. Fails when the
    /// call has no local video.
    pub async fn toggle_facing_mode(&self) -> CallResult<FacingMode> {
        let constraints = {
            let state = self.inner.state.lock();
            if state.status.is_terminal() {
                return Err(CallError::invalid_state(format!("call is {}", state.status)));
            }
            match &state.local_stream {
                Some(stream) if stream.tracks.video => MediaConstraints {
                    audio: stream.tracks.audio,
                    video: true,
                    facing_mode: state.facing_mode.toggled(),
                },
                _ => return Err(CallError::invalid_state("call has no local video track")),
            }
        };

        let result: CallResult<()> = async {
            let stream = self
                .until_ended("toggle facing mode", self.inner.media.acquire_local(&constraints))
                .await?;
            self.replace_local(stream, "toggle facing mode").await
        }
        .await;

        self.surface(result)?;
        debug!("Call {} camera now facing {}", self.id(), constraints.facing_mode);
        Ok(constraints.facing_mode)
    }

    /// Replace the local stream
    ///
    /// Outgoing tracks are swapped through the media session. Status does
    /// not change.
    pub async fn set_local_media_stream(&self, stream: LocalStream) -> CallResult<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(CallError::invalid_state(format!("call is {}", status)));
        }
        let result = self.replace_local(stream, "set local media stream").await;
        self.surface(result)
    }

    // ===== Internals =====

    fn registry(&self) -> Option<Arc<dyn CallRegistry>> {
        self.inner.registry.as_ref().and_then(Weak::upgrade)
    }

    fn unanswered_inbound(&self) -> bool {
        let state = self.inner.state.lock();
        self.inner.direction == CallDirection::In && state.status.is_pending() && !state.answering
    }

    /// Apply `trigger`; `prepare` runs under the lock after validation and
    /// may veto the transition by returning `false`.
    fn apply<F>(&self, trigger: CallTrigger, prepare: F) -> bool
    where
        F: FnOnce(&mut LegState) -> bool,
    {
        let terminal = {
            let mut state = self.inner.state.lock();
            let next = match state.status.next(self.inner.direction, &trigger) {
                Ok(next) => next,
                Err(err) => {
                    debug!("Call {}: {}", self.id(), err);
                    return false;
                }
            };
            if !prepare(&mut *state) {
                return false;
            }

            let previous = state.status;
            state.status = next;
            info!("Call {} {} -> {} ({})", self.id(), previous, next, trigger.name());

            match next {
                CallStatus::Ringing => {
                    self.inner.events.emit(CallEvent::Ringing);
                }
                CallStatus::Connected => {
                    state.connected_at = Some(Utc::now());
                    self.inner.events.emit(CallEvent::Connected);
                }
                CallStatus::Disconnected => {
                    let reason = trigger.disconnect_reason().unwrap_or(DisconnectReason::LocalHangup);
                    state.disconnect_reason = Some(reason);
                    self.inner.events.emit(CallEvent::Disconnected(reason));
                }
                CallStatus::Error => {
                    if let CallTrigger::Failed(err) = trigger {
                        error!("Call {} failed: {}", self.id(), err);
                        state.last_error = Some(err.clone());
                        self.inner.events.emit(CallEvent::Error(err));
                    }
                }
                CallStatus::Initiated => {}
            }

            if next.is_terminal() {
                state.ended_at = Some(Utc::now());
                state.local_stream = None;
                state.remote_stream = None;
                state.answering = false;
                self.inner.events.close();
            }
            next.is_terminal()
        };

        if terminal {
            self.finish();
        }
        true
    }

    /// Work that follows the terminal transition, outside the lock
    fn finish(&self) {
        self.inner.cancel.cancel();

        let media = self.inner.media.clone();
        tokio::spawn(async move { media.release().await });

        if let Some(registry) = self.registry() {
            registry.call_ended(self);
        }
    }

    fn fail(&self, err: CallError) -> bool {
        self.apply(CallTrigger::Failed(err), |_| true)
    }

    /// Move the call to `error` for any failure other than cancellation
    fn surface<T>(&self, result: CallResult<T>) -> CallResult<T> {
        if let Err(err) = &result {
            if !err.is_cancelled() {
                self.fail(err.clone());
            }
        }
        result
    }

    /// Run `fut` unless the call ends first
    async fn until_ended<T, E, F>(&self, operation: &'static str, fut: F) -> CallResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<CallError>,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(CallError::Cancelled { operation }),
            result = fut => result.map_err(Into::into),
        }
    }

    async fn store_local_stream(&self, stream: LocalStream, operation: &'static str) -> CallResult<()> {
        let stored = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                false
            } else {
                if let Some(mode) = stream.facing_mode {
                    state.facing_mode = mode;
                }
                state.local_stream = Some(stream);
                true
            }
        };
        if stored {
            Ok(())
        } else {
            // Acquired after the terminal release ran
            self.inner.media.release().await;
            Err(CallError::Cancelled { operation })
        }
    }

    async fn replace_local(&self, stream: LocalStream, operation: &'static str) -> CallResult<()> {
        self.until_ended(operation, self.inner.media.replace_local_track(&stream)).await?;

        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return Err(CallError::Cancelled { operation });
        }
        if let Some(mode) = stream.facing_mode {
            state.facing_mode = mode;
        }
        state.local_stream = Some(stream);
        Ok(())
    }

    async fn run_dial(&self) -> CallResult<()> {
        let media = self.inner.media.clone();

        let local = self.until_ended("dial", media.acquire_local(&self.inner.constraints)).await?;
        self.store_local_stream(local, "dial").await?;
        let offer = self.until_ended("dial", media.create_offer()).await?;

        let target = self.to();
        let receipt = self.inner.signaling.send_offer(&self.inner.from, &target, offer).await?;
        let session = receipt.session_id;

        let live = {
            let mut state = self.inner.state.lock();
            state.session_id = Some(session.clone());
            state.to = receipt.callee;
            !state.status.is_terminal()
        };
        debug!("Call {} bound to session {}", self.id(), session);

        if let Some(registry) = self.registry() {
            registry.bind_session(&session, self);
        }

        if !live {
            // Ended while the offer was in flight: the remote side still
            // needs to hear about it
            if let Err(err) = self.inner.signaling.leave(&session).await {
                warn!("Failed to leave session {} for ended call {}: {}", session, self.id(), err);
            }
        }
        Ok(())
    }

    async fn negotiate_answer(&self, session: SessionId, offer: OfferPayload) -> CallResult<()> {
        let media = self.inner.media.clone();

        let local = self.until_ended("answer", media.acquire_local(&self.inner.constraints)).await?;
        self.store_local_stream(local, "answer").await?;

        let negotiated = self.until_ended("answer", media.create_answer(&offer)).await?;
        self.until_ended("answer", self.inner.signaling.accept(&session, negotiated.answer))
            .await?;

        let remote = negotiated.remote_stream;
        let connected = self.apply(CallTrigger::LocalAnswered, move |state| {
            state.answering = false;
            state.remote_stream = Some(remote);
            true
        });
        if connected {
            Ok(())
        } else {
            Err(CallError::Cancelled { operation: "answer" })
        }
    }

    /// Returns whether the rejection was applied
    async fn reject_call(&self) -> CallResult<bool> {
        if self.inner.direction == CallDirection::Out {
            debug!("Ignoring reject on outgoing call {}", self.id());
            return Ok(false);
        }
        let mut session = None;
        let applied = self.apply(CallTrigger::LocalRejected, |state| {
            if state.answering {
                return false;
            }
            session = state.session_id.clone();
            true
        });
        if !applied {
            return Ok(false);
        }

        if let Some(session) = session {
            if let Err(err) = self.inner.signaling.decline(&session).await {
                warn!("Failed to decline session {} for call {}: {}", session, self.id(), err);
                return Err(err.into());
            }
        }
        info!("Rejected call {}", self.id());
        Ok(true)
    }

    /// Shared leave path for local hangup and a remote leave while connected
    async fn leave_call(&self, origin: LeaveOrigin) -> CallResult<()> {
        let trigger = match origin {
            LeaveOrigin::Local => CallTrigger::LocalHangup,
            LeaveOrigin::Remote => CallTrigger::RemoteLeft,
        };
        let mut session = None;
        let applied = self.apply(trigger, |state| {
            session = state.session_id.clone();
            true
        });
        if !applied {
            debug!("Call {} is already ended, skipping hangup", self.id());
            return Ok(());
        }

        // Without a session the dial task leaves once the offer returns
        let Some(session) = session else {
            return Ok(());
        };
        match self.inner.signaling.leave(&session).await {
            Ok(()) => {
                info!("Hung up call {}", self.id());
                Ok(())
            }
            Err(err) => {
                warn!("Failed to leave session {} for call {}: {}", session, self.id(), err);
                match origin {
                    LeaveOrigin::Local => Err(err.into()),
                    LeaveOrigin::Remote => Ok(()),
                }
            }
        }
    }

    // ===== Signaling pushes =====

    /// Queue a signaling push for this call
    pub(crate) fn deliver(&self, event: SignalingEvent) -> bool {
        self.inner.pushes.send(event).is_ok()
    }

    async fn handle_push(&self, event: SignalingEvent) {
        debug!("Call {} received {}", self.id(), event.name());
        match event {
            SignalingEvent::Acknowledged => {
                if !self.apply(CallTrigger::RemoteAcknowledged, |_| true) {
                    self.anomaly("acknowledged");
                }
            }
            SignalingEvent::Answered(answer) => self.on_remote_answer(answer).await,
            SignalingEvent::Declined => {
                if !self.apply(CallTrigger::RemoteDeclined, |_| true) {
                    self.anomaly("declined");
                }
            }
            SignalingEvent::Left => self.on_remote_left().await,
            SignalingEvent::Offer { .. } => self.anomaly("offer"),
        }
    }

    async fn on_remote_answer(&self, answer: AnswerPayload) {
        let pending = self.inner.direction == CallDirection::Out && self.status().is_pending();
        if !pending {
            self.anomaly("answered");
            return;
        }

        match self
            .until_ended("remote answer", self.inner.media.apply_remote_answer(&answer))
            .await
        {
            Ok(remote) => {
                self.apply(CallTrigger::RemoteAnswered, move |state| {
                    state.remote_stream = Some(remote);
                    true
                });
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                self.fail(err);
            }
        }
    }

    async fn on_remote_left(&self) {
        let status = self.status();
        if status == CallStatus::Connected {
            // Errors are logged inside; a remote leave never fails
            let _ = self.leave_call(LeaveOrigin::Remote).await;
        } else if !self.apply(CallTrigger::RemoteLeft, |_| true) {
            self.anomaly("left");
        }
    }

    fn anomaly(&self, what: &str) {
        warn!(
            "Protocol anomaly: unexpected {} for {} call {} in state {}",
            what,
            self.inner.direction,
            self.id(),
            self.status()
        );
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("from", &self.inner.from)
            .field("to", &state.to)
            .field("status", &state.status)
            .field("session_id", &state.session_id)
            .finish()
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Call {}

/// Applies queued pushes one at a time until the call ends
async fn run_push_worker(
    call: Weak<CallInner>,
    mut pushes: mpsc::UnboundedReceiver<SignalingEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = pushes.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = call.upgrade() else {
            break;
        };
        Call { inner }.handle_push(event).await;
    }

    // Anything still queued arrived after the call ended
    while let Ok(event) = pushes.try_recv() {
        debug!("Dropping {} push for ended call", event.name());
    }
}
