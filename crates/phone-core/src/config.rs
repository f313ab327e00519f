//! Phone configuration
//!
//! ```rust
//! use duplex_phone_core::{MediaConstraints, PhoneConfig};
//!
//! let config = PhoneConfig::new("alice@example.com")
//!     .with_display_name("Alice")
//!     .with_default_constraints(MediaConstraints::audio_only())
//!     .with_event_capacity(128);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.participant().address, "alice@example.com");
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};
use crate::types::{MediaConstraints, Participant};

/// Default capacity of per-call and per-phone event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Default number of notifications held for a session no call has claimed yet
pub const DEFAULT_MAX_EARLY_NOTIFICATIONS: usize = 64;

/// Default number of ended sessions remembered, and of unclaimed sessions held
pub const DEFAULT_MAX_SESSION_HISTORY: usize = 256;

/// Configuration for a [`Phone`](crate::Phone)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneConfig {
    /// Identity the phone registers as
    pub identity: String,

    /// Address other parties dial; defaults to the identity
    #[serde(default)]
    pub address: Option<String>,

    /// Optional display name
    #[serde(default)]
    pub display_name: Option<String>,

    /// Constraints for `dial` calls made without explicit constraints, and
    /// for every incoming call
    ///
    /// `Call::answer` takes no constraints; an incoming call acquires local
    /// media with these.
    #[serde(default)]
    pub default_constraints: MediaConstraints,

    /// Capacity of each event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Bound on notifications buffered per unclaimed session
    #[serde(default = "default_max_early_notifications")]
    pub max_early_notifications: usize,

    /// Bound on ended sessions remembered for dropping late notifications,
    /// and on unclaimed sessions with held notifications. The oldest entry
    /// is forgotten first.
    #[serde(default = "default_max_session_history")]
    pub max_session_history: usize,
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_max_early_notifications() -> usize {
    DEFAULT_MAX_EARLY_NOTIFICATIONS
}

fn default_max_session_history() -> usize {
    DEFAULT_MAX_SESSION_HISTORY
}

impl PhoneConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: None,
            display_name: None,
            default_constraints: MediaConstraints::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_early_notifications: DEFAULT_MAX_EARLY_NOTIFICATIONS,
            max_session_history: DEFAULT_MAX_SESSION_HISTORY,
        }
    }

    /// Parse a configuration from JSON and validate it
    pub fn from_json(json: &str) -> PhoneResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| PhoneError::config(format!("invalid phone config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_default_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.default_constraints = constraints;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_max_early_notifications(mut self, max: usize) -> Self {
        self.max_early_notifications = max;
        self
    }

    pub fn with_max_session_history(mut self, max: usize) -> Self {
        self.max_session_history = max;
        self
    }

    pub fn validate(&self) -> PhoneResult<()> {
        if self.identity.trim().is_empty() {
            return Err(PhoneError::config("identity must not be empty"));
        }
        if matches!(&self.address, Some(address) if address.trim().is_empty()) {
            return Err(PhoneError::config("address must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(PhoneError::config("event_capacity must be at least 1"));
        }
        if self.max_session_history == 0 {
            return Err(PhoneError::config("max_session_history must be at least 1"));
        }
        Ok(())
    }

    /// The local participant this configuration describes
    pub fn participant(&self) -> Participant {
        let address = self.address.clone().unwrap_or_else(|| self.identity.clone());
        let participant = Participant::new(self.identity.clone(), address);
        match &self.display_name {
            Some(name) => participant.with_display_name(name.clone()),
            None => participant,
        }
    }
}
