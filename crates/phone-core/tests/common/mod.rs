//! Shared helpers for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use duplex_phone_core::loopback::{LoopbackMediaEngine, MediaBehavior, Switchboard};
use duplex_phone_core::{
    setup_logging, Call, CallEvent, CallEventKind, CallStatus, LoggingConfig, MediaConstraints, Phone,
    PhoneConfig,
};
use tokio::sync::broadcast;

pub const ALICE: &str = "alice@example.com";
pub const BOB: &str = "bob@example.com";

const WAIT: Duration = Duration::from_secs(5);

/// Two registered phones on one switchboard
pub struct Pair {
    pub board: Switchboard,
    pub media: Arc<LoopbackMediaEngine>,
    pub alice: Phone,
    pub bob: Phone,
}

pub fn init_logging() {
    // Another test may already have installed a subscriber
    let _ = setup_logging(LoggingConfig::new(tracing::Level::DEBUG, "phone-core-tests"));
}

pub async fn pair() -> Pair {
    pair_with(MediaBehavior::default()).await
}

pub async fn pair_with(behavior: MediaBehavior) -> Pair {
    init_logging();

    let board = Switchboard::new();
    let media = Arc::new(LoopbackMediaEngine::with_behavior(behavior));

    let alice = Phone::new(
        PhoneConfig::new(ALICE).with_display_name("Alice"),
        board.endpoint(),
        media.clone(),
    )
    .expect("valid config");
    let bob = Phone::new(
        PhoneConfig::new(BOB).with_display_name("Bob"),
        board.endpoint(),
        media.clone(),
    )
    .expect("valid config");

    alice.register().await.expect("alice registers");
    bob.register().await.expect("bob registers");

    Pair {
        board,
        media,
        alice,
        bob,
    }
}

/// Await `fut`, failing the test if it takes too long
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Poll `check` until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for `call` to reach `status`
pub async fn wait_for_status(call: &Call, status: CallStatus) {
    let description = format!("call {} to reach {}", call.id(), status);
    eventually(&description, || call.status() == status).await;
}

/// Dial Bob from Alice and answer, returning (outgoing, incoming)
pub async fn connect(pair: &Pair, constraints: Option<MediaConstraints>) -> (Call, Call) {
    let incoming = pair.bob.next_incoming();
    let outgoing = pair.alice.dial(BOB, constraints).expect("dial");
    let connected = outgoing.when(CallEventKind::Connected);

    let incoming = within("incoming call", incoming).await.expect("incoming call");
    within("answer", incoming.answer()).await.expect("answer");
    within("connected", connected).await.expect("connected event");
    assert_eq!(incoming.status(), CallStatus::Connected);

    (outgoing, incoming)
}

/// Drain every event a subscription has buffered until it closes
pub async fn collect_events(mut events: broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    loop {
        match within("event stream to close", events.recv()).await {
            Ok(event) => seen.push(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}
