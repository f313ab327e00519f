//! Event system for calls and phones
//!
//! Each [`Call`] and each [`Phone`](crate::Phone) owns an [`EventEmitter`]. An
//! emitter is a broadcast channel that can be closed: once a call reaches a
//! terminal state its emitter is closed after the final event, so every
//! subscriber drains what was already sent and then sees the end of the
//! stream. Late subscribers only observe events that have not happened yet.

use std::fmt;
use std::future::Future;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::Call;
use crate::error::CallError;
use crate::registration::RegistrationState;
use crate::types::DisconnectReason;

/// Stream of events from an emitter
pub type EventStream<E> = BroadcastStream<E>;

/// Events emitted by a [`Call`]
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Remote device is alerting
    Ringing,
    /// Media is negotiated and both parties are in the call
    Connected,
    /// The call ended normally
    Disconnected(DisconnectReason),
    /// The call failed
    Error(CallError),
}

impl CallEvent {
    pub fn kind(&self) -> CallEventKind {
        match self {
            CallEvent::Ringing => CallEventKind::Ringing,
            CallEvent::Connected => CallEventKind::Connected,
            CallEvent::Disconnected(_) => CallEventKind::Disconnected,
            CallEvent::Error(_) => CallEventKind::Error,
        }
    }
}

/// Event names, used to wait for a particular event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    Ringing,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for CallEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEventKind::Ringing => write!(f, "ringing"),
            CallEventKind::Connected => write!(f, "connected"),
            CallEventKind::Disconnected => write!(f, "disconnected"),
            CallEventKind::Error => write!(f, "error"),
        }
    }
}

/// Events emitted by a [`Phone`](crate::Phone)
#[derive(Debug, Clone)]
pub enum PhoneEvent {
    /// A remote party offered a new call
    IncomingCall(Call),

    /// Registration state changed
    RegistrationChanged {
        previous: RegistrationState,
        current: RegistrationState,
    },
}

/// Closable broadcast emitter
pub struct EventEmitter<E> {
    sender: RwLock<Option<broadcast::Sender<E>>>,
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// Emit an event, returning how many subscribers received it
    pub fn emit(&self, event: E) -> usize {
        match self.sender.read().as_ref() {
            // No receivers is not an error
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to future events
    ///
    /// After [`close`](Self::close) the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        match self.sender.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        }
    }

    /// Subscribe to future events as a stream
    pub fn events(&self) -> EventStream<E> {
        BroadcastStream::new(self.subscribe())
    }

    /// Stop emitting. Existing subscribers still receive buffered events.
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Resolve on the next event matching `predicate`
    ///
    /// The subscription is taken when this is called, not when the future is
    /// first polled. Resolves to `None` if the emitter closes first.
    pub fn next_matching<F>(&self, predicate: F) -> impl Future<Output = Option<E>> + Send + 'static
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        let mut receiver = self.subscribe();
        async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if predicate(&event) => return Some(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }
}
