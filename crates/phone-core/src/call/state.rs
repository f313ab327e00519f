//! Call status and transition table

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CallError;
use crate::types::{CallDirection, DisconnectReason};

/// Observable status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, not yet alerting or answered
    Initiated,
    /// Remote device is alerting (outbound only)
    Ringing,
    /// Media negotiated, call in progress
    Connected,
    /// Ended normally
    Disconnected,
    /// Ended by an unrecoverable failure
    Error,
}

impl CallStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Disconnected | CallStatus::Error)
    }

    /// Whether the call has not been answered yet
    pub fn is_pending(&self) -> bool {
        matches!(self, CallStatus::Initiated | CallStatus::Ringing)
    }

    /// Apply `trigger` to this status for a call going in `direction`
    pub fn next(self, direction: CallDirection, trigger: &CallTrigger) -> Result<CallStatus, InvalidTransition> {
        use CallDirection::{In, Out};
        use CallStatus::*;

        let next = match (self, direction, trigger) {
            (Initiated, Out, CallTrigger::RemoteAcknowledged) => Ringing,

            (Initiated | Ringing, Out, CallTrigger::RemoteAnswered) => Connected,
            (Initiated | Ringing, In, CallTrigger::LocalAnswered) => Connected,

            (Initiated | Ringing, _, CallTrigger::RemoteDeclined) => Disconnected,
            (Initiated | Ringing, In, CallTrigger::LocalRejected) => Disconnected,
            (Initiated | Ringing | Connected, _, CallTrigger::LocalHangup) => Disconnected,
            (Initiated | Ringing | Connected, _, CallTrigger::RemoteLeft) => Disconnected,

            (Initiated | Ringing | Connected, _, CallTrigger::Failed(_)) => Error,

            _ => {
                return Err(InvalidTransition {
                    from: self,
                    direction,
                    trigger: trigger.name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Initiated => write!(f, "initiated"),
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::Connected => write!(f, "connected"),
            CallStatus::Disconnected => write!(f, "disconnected"),
            CallStatus::Error => write!(f, "error"),
        }
    }
}

/// Inputs that move a call between statuses
#[derive(Debug, Clone, PartialEq)]
pub enum CallTrigger {
    RemoteAcknowledged,
    RemoteAnswered,
    LocalAnswered,
    RemoteDeclined,
    LocalRejected,
    LocalHangup,
    RemoteLeft,
    Failed(CallError),
}

impl CallTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            CallTrigger::RemoteAcknowledged => "remote-acknowledged",
            CallTrigger::RemoteAnswered => "remote-answered",
            CallTrigger::LocalAnswered => "local-answered",
            CallTrigger::RemoteDeclined => "remote-declined",
            CallTrigger::LocalRejected => "local-rejected",
            CallTrigger::LocalHangup => "local-hangup",
            CallTrigger::RemoteLeft => "remote-left",
            CallTrigger::Failed(_) => "failed",
        }
    }

    /// Reason recorded when this trigger ends the call normally
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            CallTrigger::RemoteDeclined => Some(DisconnectReason::Declined),
            CallTrigger::LocalRejected => Some(DisconnectReason::Rejected),
            CallTrigger::LocalHangup => Some(DisconnectReason::LocalHangup),
            CallTrigger::RemoteLeft => Some(DisconnectReason::RemoteLeft),
            _ => None,
        }
    }
}

/// A trigger that does not apply to the current status
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no transition from {from} on {trigger} for {direction} call")]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub direction: CallDirection,
    pub trigger: &'static str,
}
