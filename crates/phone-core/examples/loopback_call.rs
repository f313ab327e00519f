//! Two phones on an in-process switchboard: dial, ring, answer, talk, hang up.
//!
//! ```text
//! RUST_LOG=duplex_phone_core=debug cargo run --example loopback_call
//! LOG_JSON=1 cargo run --example loopback_call
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use duplex_phone_core::loopback::{LoopbackMediaEngine, Switchboard};
use duplex_phone_core::{setup_logging, CallEventKind, LoggingConfig, Phone, PhoneConfig};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(LoggingConfig {
        json: std::env::var_os("LOG_JSON").is_some(),
        ..LoggingConfig::new(Level::INFO, "loopback_call")
    })?;

    let board = Switchboard::new();
    let media = Arc::new(LoopbackMediaEngine::new());

    let alice = Phone::new(
        PhoneConfig::new("alice@example.com").with_display_name("Alice"),
        board.endpoint(),
        media.clone(),
    )?;
    let bob = Phone::new(
        PhoneConfig::new("bob@example.com").with_display_name("Bob"),
        board.endpoint(),
        media.clone(),
    )?;
    alice.register().await?;
    bob.register().await?;

    // Bob alerts, waits a moment, then answers
    let callee = bob.clone();
    let answering = tokio::spawn(async move {
        let call = callee.next_incoming().await?;
        info!("Bob sees an incoming call from {}", call.from());
        call.acknowledge().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        call.answer().await?;
        Ok::<_, anyhow::Error>(call)
    });

    let call = alice.dial("bob@example.com", None)?;
    let ringing = call.when(CallEventKind::Ringing);
    let connected = call.when(CallEventKind::Connected);
    info!("Alice dialed, call {} is {}", call.id(), call.status());

    ringing.await?;
    info!("Alice hears ringing");
    connected.await?;
    let incoming = answering.await.context("answer task panicked")??;

    info!(
        "Connected: alice sends audio={} video={}, receives audio={} video={}",
        call.sending_audio(),
        call.sending_video(),
        call.receiving_audio(),
        call.receiving_video()
    );

    let mode = call.toggle_facing_mode().await?;
    info!("Alice switched camera to {}", mode);

    tokio::time::sleep(Duration::from_secs(1)).await;

    let disconnected = incoming.when(CallEventKind::Disconnected);
    call.hangup().await?;
    disconnected.await?;
    info!(
        "Call ended: alice {:?}, bob {:?}",
        call.disconnect_reason(),
        incoming.disconnect_reason()
    );

    alice.deregister().await?;
    bob.deregister().await?;

    let stats = media.stats();
    info!(
        "Media sessions: {} created, {} acquired, {} released",
        stats.sessions, stats.acquired, stats.released
    );
    Ok(())
}
