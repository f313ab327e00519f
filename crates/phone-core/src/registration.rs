//! Registration state of a phone

use std::fmt;

use serde::{Deserialize, Serialize};

/// Registration state with the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
}

impl RegistrationState {
    /// Whether outbound calls may be placed in this state
    pub fn accepts_dial(&self) -> bool {
        matches!(self, RegistrationState::Registering | RegistrationState::Registered)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Registering => write!(f, "registering"),
            RegistrationState::Registered => write!(f, "registered"),
        }
    }
}
