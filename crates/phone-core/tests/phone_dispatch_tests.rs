//! Registration and notification routing

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use duplex_phone_core::loopback::{LoopbackMediaEngine, SignalingOp, Switchboard};
use duplex_phone_core::{
    AnswerPayload, CallError, CallEvent, CallEventKind, CallStatus, MediaConstraints, NotificationStream,
    OfferPayload, OfferReceipt, Participant, Phone, PhoneConfig, PhoneError, PhoneEvent, RegistrationState, SessionId, SignalingChannel,
    SignalingError, SignalingEvent, SignalingNotification,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};

/// Signaling channel driven by the test
///
/// Pushes are injected with [`ScriptedSignaling::push`]. `send_offer` waits
/// for [`ScriptedSignaling::release_offer`] before returning `session`.
struct ScriptedSignaling {
    session: SessionId,
    sender: Mutex<Option<mpsc::UnboundedSender<SignalingNotification>>>,
    offer_gate: Notify,
    requests: Mutex<Vec<(&'static str, Option<SessionId>)>>,
}

impl ScriptedSignaling {
    fn new(session: &str) -> Arc<Self> {
        Arc::new(Self {
            session: SessionId::new(session),
            sender: Mutex::new(None),
            offer_gate: Notify::new(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, session: &str, event: SignalingEvent) {
        let sender = self.sender.lock();
        let sender = sender.as_ref().expect("registered");
        sender
            .send(SignalingNotification::new(SessionId::new(session), event))
            .expect("dispatch running");
    }

    fn release_offer(&self) {
        self.offer_gate.notify_one();
    }

    fn requested(&self, op: &str) -> usize {
        self.requests.lock().iter().filter(|(name, _)| *name == op).count()
    }

    fn record(&self, op: &'static str, session: Option<&SessionId>) {
        self.requests.lock().push((op, session.cloned()));
    }
}

#[async_trait]
impl SignalingChannel for ScriptedSignaling {
    async fn register(&self, _local: &Participant) -> Result<NotificationStream, SignalingError> {
        self.record("register", None);
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(sender);
        Ok(receiver)
    }

    async fn deregister(&self, _local: &Participant) -> Result<(), SignalingError> {
        self.record("deregister", None);
        Ok(())
    }

    async fn send_offer(
        &self,
        _from: &Participant,
        target: &Participant,
        _offer: OfferPayload,
    ) -> Result<OfferReceipt, SignalingError> {
        self.record("offer", None);
        self.offer_gate.notified().await;
        Ok(OfferReceipt::new(self.session.clone(), target.clone()))
    }

    async fn acknowledge(&self, session: &SessionId) -> Result<(), SignalingError> {
        self.record("acknowledge", Some(session));
        Ok(())
    }

    async fn accept(&self, session: &SessionId, _answer: AnswerPayload) -> Result<(), SignalingError> {
        self.record("accept", Some(session));
        Ok(())
    }

    async fn decline(&self, session: &SessionId) -> Result<(), SignalingError> {
        self.record("decline", Some(session));
        Ok(())
    }

    async fn leave(&self, session: &SessionId) -> Result<(), SignalingError> {
        self.record("leave", Some(session));
        Ok(())
    }
}

async fn scripted_phone(session: &str) -> (Phone, Arc<ScriptedSignaling>) {
    scripted_phone_with(session, PhoneConfig::new(ALICE)).await
}

async fn scripted_phone_with(session: &str, config: PhoneConfig) -> (Phone, Arc<ScriptedSignaling>) {
    init_logging();
    let signaling = ScriptedSignaling::new(session);
    let phone = Phone::new(
        config,
        signaling.clone(),
        Arc::new(LoopbackMediaEngine::new()),
    )
    .expect("valid config");
    phone.register().await.expect("register");
    (phone, signaling)
}

fn offer_from_bob() -> SignalingEvent {
    SignalingEvent::Offer {
        from: Participant::new(BOB, BOB),
        offer: OfferPayload("audio=1;video=1".to_string()),
    }
}

fn incoming_calls(events: &mut broadcast::Receiver<PhoneEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PhoneEvent::IncomingCall(_)) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_dial_requires_registration() {
    init_logging();
    let board = Switchboard::new();
    let phone = Phone::new(
        PhoneConfig::new(ALICE),
        board.endpoint(),
        Arc::new(LoopbackMediaEngine::new()),
    )
    .expect("valid config");

    assert_eq!(phone.registration_state(), RegistrationState::Unregistered);
    assert!(matches!(phone.dial(BOB, None), Err(PhoneError::NotRegistered)));
}

#[tokio::test]
async fn test_register_reports_state_changes() {
    init_logging();
    let board = Switchboard::new();
    let phone = Phone::new(
        PhoneConfig::new(ALICE),
        board.endpoint(),
        Arc::new(LoopbackMediaEngine::new()),
    )
    .expect("valid config");
    let mut events = phone.subscribe();

    phone.register().await.expect("register");
    phone.register().await.expect("second register is a no-op");

    assert_eq!(phone.registration_state(), RegistrationState::Registered);
    assert!(board.is_registered(ALICE));
    assert_eq!(board.count(SignalingOp::Register), 1);

    let mut transitions = Vec::new();
    while let Ok(PhoneEvent::RegistrationChanged { previous, current }) = events.try_recv() {
        transitions.push((previous, current));
    }
    assert_eq!(
        transitions,
        vec![
            (RegistrationState::Unregistered, RegistrationState::Registering),
            (RegistrationState::Registering, RegistrationState::Registered),
        ]
    );
}

#[tokio::test]
async fn test_registration_failure_reverts_state() {
    init_logging();
    let board = Switchboard::new();
    board.fail_next(SignalingOp::Register, SignalingError::Rejected("maintenance".to_string()));
    let phone = Phone::new(
        PhoneConfig::new(ALICE),
        board.endpoint(),
        Arc::new(LoopbackMediaEngine::new()),
    )
    .expect("valid config");

    let err = phone.register().await.unwrap_err();
    assert!(matches!(err, PhoneError::Registration(SignalingError::Rejected(_))));
    assert_eq!(phone.registration_state(), RegistrationState::Unregistered);

    phone.register().await.expect("retry succeeds");
    assert_eq!(phone.registration_state(), RegistrationState::Registered);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let board = Switchboard::new();
    let result = Phone::new(
        PhoneConfig::new(""),
        board.endpoint(),
        Arc::new(LoopbackMediaEngine::new()),
    );
    assert!(matches!(result, Err(PhoneError::Configuration { .. })));
}

#[tokio::test]
async fn test_deregister_stops_incoming_dispatch() {
    let pair = pair().await;

    pair.bob.deregister().await.expect("deregister");
    assert_eq!(pair.bob.registration_state(), RegistrationState::Unregistered);
    assert!(!pair.board.is_registered(BOB));

    let mut bob_events = pair.bob.subscribe();
    let call = pair.alice.dial(BOB, None).expect("dial");
    let event = within("error", call.when(CallEventKind::Error)).await.expect("error event");

    assert!(matches!(event, CallEvent::Error(CallError::Resolution { .. })));
    assert_eq!(incoming_calls(&mut bob_events), 0);
    assert!(pair.bob.active_calls().is_empty());
    assert!(matches!(pair.bob.dial(ALICE, None), Err(PhoneError::NotRegistered)));
}

#[tokio::test]
async fn test_deregister_leaves_calls_in_progress() {
    let pair = pair().await;
    let (call, incoming) = connect(&pair, None).await;

    pair.alice.deregister().await.expect("deregister");

    assert_eq!(call.status(), CallStatus::Connected);
    assert_eq!(pair.alice.active_calls().len(), 1);

    within("remote hangup", incoming.hangup()).await.expect("hangup");
    within("local hangup", call.hangup()).await.expect("hangup");
    assert!(pair.alice.active_calls().is_empty());
}

#[tokio::test]
async fn test_incoming_call_is_published_once() {
    let (phone, signaling) = scripted_phone("s-1").await;
    let mut events = phone.subscribe();

    let incoming = phone.next_incoming();
    signaling.push("s-9", offer_from_bob());
    let call = within("incoming call", incoming).await.expect("incoming call");
    signaling.push("s-9", offer_from_bob());
    signaling.push("s-9", SignalingEvent::Acknowledged);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(incoming_calls(&mut events), 1);
    assert_eq!(phone.active_calls().len(), 1);
    assert_eq!(call.session_id(), Some(SessionId::new("s-9")));
    assert_eq!(call.status(), CallStatus::Initiated);

    within("answer", call.answer()).await.expect("answer");
    assert_eq!(call.status(), CallStatus::Connected);
    assert_eq!(signaling.requested("accept"), 1);
}

#[tokio::test]
async fn test_notifications_before_offer_returns_are_replayed() {
    let (phone, signaling) = scripted_phone("s-1").await;

    let call = phone.dial(BOB, None).expect("dial");
    let mut events = call.subscribe();
    eventually("offer to be sent", || signaling.requested("offer") == 1).await;

    // The remote side answers before the offer round-trip completes
    signaling.push("s-1", SignalingEvent::Acknowledged);
    signaling.push("s-1", SignalingEvent::Answered(AnswerPayload("audio=1;video=0".to_string())));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call.status(), CallStatus::Initiated);

    signaling.release_offer();

    assert_eq!(within("ringing", events.recv()).await.unwrap(), CallEvent::Ringing);
    assert_eq!(within("connected", events.recv()).await.unwrap(), CallEvent::Connected);
    assert_eq!(call.session_id(), Some(SessionId::new("s-1")));
    assert!(call.receiving_audio());
    assert!(!call.receiving_video());

    within("hangup", call.hangup()).await.expect("hangup");
    assert_eq!(signaling.requested("leave"), 1);
}

#[tokio::test]
async fn test_notifications_for_ended_sessions_are_dropped() {
    let (phone, signaling) = scripted_phone("s-1").await;
    let mut phone_events = phone.subscribe();

    let incoming = phone.next_incoming();
    signaling.push("s-5", offer_from_bob());
    let call = within("incoming call", incoming).await.expect("incoming call");
    within("reject", call.reject()).await.expect("reject");
    assert_eq!(signaling.requested("decline"), 1);
    eventually("call to leave the active set", || phone.active_calls().is_empty()).await;

    // Neither a late leave nor a replayed offer revives the session
    signaling.push("s-5", SignalingEvent::Left);
    signaling.push("s-5", offer_from_bob());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(incoming_calls(&mut phone_events), 1);
    assert!(phone.active_calls().is_empty());
    assert_eq!(call.status(), CallStatus::Disconnected);
}

#[tokio::test]
async fn test_hangup_while_offer_in_flight_leaves_session() {
    let (phone, signaling) = scripted_phone("s-1").await;

    let call = phone.dial(BOB, None).expect("dial");
    eventually("offer to be sent", || signaling.requested("offer") == 1).await;

    within("hangup", call.hangup()).await.expect("hangup");
    assert_eq!(call.status(), CallStatus::Disconnected);
    assert_eq!(signaling.requested("leave"), 0);

    signaling.release_offer();
    eventually("leave once the session is known", || signaling.requested("leave") == 1).await;
    assert_eq!(call.session_id(), Some(SessionId::new("s-1")));

    // Late pushes for the abandoned session go nowhere
    signaling.push("s-1", SignalingEvent::Acknowledged);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call.status(), CallStatus::Disconnected);
    assert!(phone.active_calls().is_empty());
}

#[tokio::test]
async fn test_active_set_tracks_live_calls() {
    let pair = pair().await;
    let (call, incoming) = connect(&pair, None).await;

    assert_eq!(pair.alice.active_calls(), vec![call.clone()]);
    assert_eq!(pair.bob.call(&incoming.id()), Some(incoming.clone()));

    within("hangup", call.hangup()).await.expect("hangup");
    eventually("both active sets to empty", || {
        pair.alice.active_calls().is_empty() && pair.bob.active_calls().is_empty()
    })
    .await;

    // Removed calls stay inspectable but are silent
    assert_eq!(pair.bob.call(&incoming.id()), None);
    assert_eq!(incoming.status(), CallStatus::Disconnected);
    let mut late = incoming.subscribe();
    assert!(late.recv().await.is_err());
}

#[tokio::test]
async fn test_independent_calls_progress_separately() {
    let pair = pair().await;
    let (first, first_incoming) = connect(&pair, None).await;
    let (second, _second_incoming) = connect(&pair, None).await;

    assert_eq!(pair.alice.active_calls().len(), 2);
    within("hangup", first.hangup()).await.expect("hangup");
    wait_for_status(&first_incoming, CallStatus::Disconnected).await;

    assert_eq!(second.status(), CallStatus::Connected);
    assert_eq!(pair.alice.active_calls(), vec![second.clone()]);

    within("hangup", second.hangup()).await.expect("hangup");
}

#[tokio::test]
async fn test_early_notifications_beyond_limit_are_dropped() {
    let (phone, signaling) =
        scripted_phone_with("s-1", PhoneConfig::new(ALICE).with_max_early_notifications(1)).await;

    let call = phone.dial(BOB, None).expect("dial");
    let mut events = call.subscribe();
    eventually("offer to be sent", || signaling.requested("offer") == 1).await;

    signaling.push("s-1", SignalingEvent::Acknowledged);
    signaling.push("s-1", SignalingEvent::Answered(AnswerPayload("audio=1;video=0".to_string())));
    tokio::time::sleep(Duration::from_millis(20)).await;

    signaling.release_offer();
    assert_eq!(within("ringing", events.recv()).await.unwrap(), CallEvent::Ringing);
    eventually("session to bind", || call.session_id().is_some()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Only the first held notification survives
    assert_eq!(call.status(), CallStatus::Ringing);
    assert!(events.try_recv().is_err());

    within("hangup", call.hangup()).await.expect("hangup");
    assert_eq!(signaling.requested("leave"), 1);
}

#[tokio::test]
async fn test_incoming_calls_use_default_constraints() {
    let config = PhoneConfig::new(ALICE).with_default_constraints(MediaConstraints::audio_only());
    let (phone, signaling) = scripted_phone_with("s-1", config).await;

    let incoming = phone.next_incoming();
    signaling.push("s-3", offer_from_bob());
    let call = within("incoming call", incoming).await.expect("incoming call");
    assert_eq!(call.constraints(), MediaConstraints::audio_only());

    within("answer", call.answer()).await.expect("answer");
    assert!(call.sending_audio());
    assert!(!call.sending_video());
    assert!(call.receiving_audio());
    assert!(!call.receiving_video());
    assert_eq!(call.facing_mode(), None);
}
