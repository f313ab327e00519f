//! Deterministic media engine
//!
//! Offers and answers carry the track flags of the side that produced them,
//! encoded as `audio=1;video=0`. An answer carries the tracks both sides
//! have, and both sides see those tracks as the remote stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::MediaError;
use crate::media::{MediaSession, MediaSessionFactory, NegotiatedAnswer};
use crate::types::{
    AnswerPayload, CallId, LocalStream, MediaConstraints, MediaTracks, OfferPayload, RemoteStream,
};

/// Encode track flags as a payload body
pub fn encode_tracks(tracks: MediaTracks) -> String {
    format!("audio={};video={}", tracks.audio as u8, tracks.video as u8)
}

/// Parse a payload body produced by [`encode_tracks`]
pub fn parse_tracks(payload: &str) -> Result<MediaTracks, MediaError> {
    let mut tracks = MediaTracks::default();
    for part in payload.split(';') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| MediaError::Negotiation(format!("malformed payload `{}`", payload)))?;
        let enabled = match value {
            "1" => true,
            "0" => false,
            other => return Err(MediaError::Negotiation(format!("bad flag `{}`", other))),
        };
        match key {
            "audio" => tracks.audio = enabled,
            "video" => tracks.video = enabled,
            other => return Err(MediaError::Negotiation(format!("unknown track `{}`", other))),
        }
    }
    Ok(tracks)
}

/// Failure and timing knobs
#[derive(Debug, Clone, Default)]
pub struct MediaBehavior {
    pub fail_acquire: bool,
    pub fail_negotiation: bool,
    pub acquire_delay: Option<Duration>,
}

/// Counters shared by every session of an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub sessions: usize,
    pub acquired: usize,
    pub replaced: usize,
    pub released: usize,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicUsize,
    acquired: AtomicUsize,
    replaced: AtomicUsize,
    released: AtomicUsize,
}

/// [`MediaSessionFactory`] producing [`LoopbackMediaSession`]s
#[derive(Default)]
pub struct LoopbackMediaEngine {
    behavior: Mutex<MediaBehavior>,
    counters: Arc<Counters>,
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MediaBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            counters: Arc::default(),
        }
    }

    /// Change behavior for sessions created from now on
    pub fn set_behavior(&self, behavior: MediaBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            sessions: self.counters.sessions.load(Ordering::SeqCst),
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            replaced: self.counters.replaced.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
        }
    }
}

impl MediaSessionFactory for LoopbackMediaEngine {
    fn create_session(&self, call_id: &CallId) -> Arc<dyn MediaSession> {
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);
        Arc::new(LoopbackMediaSession {
            call_id: *call_id,
            behavior: self.behavior.lock().clone(),
            counters: self.counters.clone(),
            state: Mutex::new(SessionState::default()),
        })
    }
}

#[derive(Default)]
struct SessionState {
    local: Option<LocalStream>,
    released: bool,
}

/// Media session for one call
pub struct LoopbackMediaSession {
    call_id: CallId,
    behavior: MediaBehavior,
    counters: Arc<Counters>,
    state: Mutex<SessionState>,
}

impl LoopbackMediaSession {
    fn local_tracks(&self) -> Result<MediaTracks, MediaError> {
        let state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        state
            .local
            .as_ref()
            .map(|stream| stream.tracks)
            .ok_or_else(|| MediaError::Negotiation("no local stream acquired".to_string()))
    }

    fn check_negotiation(&self) -> Result<(), MediaError> {
        if self.behavior.fail_negotiation {
            return Err(MediaError::Negotiation("injected negotiation failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for LoopbackMediaSession {
    async fn acquire_local(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(delay) = self.behavior.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_acquire {
            return Err(MediaError::Acquisition("injected acquisition failure".to_string()));
        }

        let stream = LocalStream::new(constraints.tracks(), Some(constraints.facing_mode));
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        state.local = Some(stream.clone());
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired local stream {} for call {}", stream.id, self.call_id);
        Ok(stream)
    }

    async fn create_offer(&self) -> Result<OfferPayload, MediaError> {
        self.check_negotiation()?;
        Ok(OfferPayload(encode_tracks(self.local_tracks()?)))
    }

    async fn apply_remote_answer(&self, answer: &AnswerPayload) -> Result<RemoteStream, MediaError> {
        self.check_negotiation()?;
        let local = self.local_tracks()?;
        let answered = parse_tracks(&answer.0)?;
        Ok(RemoteStream::new(answered.intersect(local)))
    }

    async fn create_answer(&self, offer: &OfferPayload) -> Result<NegotiatedAnswer, MediaError> {
        self.check_negotiation()?;
        let local = self.local_tracks()?;
        let common = parse_tracks(&offer.0)?.intersect(local);
        Ok(NegotiatedAnswer {
            answer: AnswerPayload(encode_tracks(common)),
            remote_stream: RemoteStream::new(common),
        })
    }

    async fn replace_local_track(&self, stream: &LocalStream) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(MediaError::Released);
        }
        state.local = Some(stream.clone());
        self.counters.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        state.released = true;
        state.local = None;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!("Released media for call {}", self.call_id);
    }
}
