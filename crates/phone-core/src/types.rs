//! Shared value types: identifiers, participants, media descriptions
//!
//! Offer and answer payloads are opaque to this crate. They are produced by a
//! [`MediaSession`](crate::MediaSession) and carried unchanged through the
//! [`SignalingChannel`](crate::SignalingChannel).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the local leg of a call
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the conversation, assigned by the signaling intermediary
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session id
    pub fn random() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A party to a call: who they are and where they can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Identity of the person (e.g. "bob@example.com")
    pub person: String,
    /// Address the signaling channel routes to
    pub address: String,
    /// Optional human readable name
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(person: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            person: person.into(),
            address: address.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Participant for a dial target before the intermediary resolves it
    pub fn from_target(target: &str) -> Self {
        Self::new(target, target)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => write!(f, "<{}>", self.address),
        }
    }
}

/// Which party originated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Locally originated
    Out,
    /// Received from a remote party
    In,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Out => write!(f, "out"),
            CallDirection::In => write!(f, "in"),
        }
    }
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Rear camera
    Environment,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

/// Local capture constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing_mode: FacingMode,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            facing_mode: FacingMode::User,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }

    pub fn with_audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    pub fn with_facing_mode(mut self, facing_mode: FacingMode) -> Self {
        self.facing_mode = facing_mode;
        self
    }

    pub fn tracks(&self) -> MediaTracks {
        MediaTracks {
            audio: self.audio,
            video: self.video,
        }
    }
}

/// Which kinds of tracks a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaTracks {
    pub audio: bool,
    pub video: bool,
}

impl MediaTracks {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }

    /// Tracks present on both sides
    pub fn intersect(self, other: MediaTracks) -> MediaTracks {
        MediaTracks {
            audio: self.audio && other.audio,
            video: self.video && other.video,
        }
    }
}

/// Local capture stream vended by a media session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: MediaTracks,
    /// Set when the stream carries a camera track
    pub facing_mode: Option<FacingMode>,
}

impl LocalStream {
    pub fn new(tracks: MediaTracks, facing_mode: Option<FacingMode>) -> Self {
        Self {
            id: format!("local-{}", Uuid::new_v4()),
            tracks,
            facing_mode: if tracks.video { facing_mode } else { None },
        }
    }
}

/// Negotiated remote stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: MediaTracks,
}

impl RemoteStream {
    pub fn new(tracks: MediaTracks) -> Self {
        Self {
            id: format!("remote-{}", Uuid::new_v4()),
            tracks,
        }
    }
}

/// Opaque offer produced by the media layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload(pub String);

/// Opaque answer produced by the media layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload(pub String);

/// Why a call reached `disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// Local `hangup()`
    LocalHangup,
    /// The remote party left
    RemoteLeft,
    /// The remote party declined before answering
    Declined,
    /// Local `reject()` of an inbound call
    Rejected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalHangup => write!(f, "local-hangup"),
            DisconnectReason::RemoteLeft => write!(f, "remote-left"),
            DisconnectReason::Declined => write!(f, "declined"),
            DisconnectReason::Rejected => write!(f, "rejected"),
        }
    }
}
