//! Phone: registration lifecycle and call dispatch
//!
//! A [`Phone`] registers a local participant with a [`SignalingChannel`],
//! originates outbound calls with [`dial`](Phone::dial) and turns inbound
//! offers into [`Call`]s published as [`PhoneEvent::IncomingCall`].
//!
//! # Routing
//!
//! Every push from the signaling subscription carries a session id. The
//! dispatch task routes it as follows:
//!
//! - a session bound to a live call: queued on that call;
//! - an offer for an unknown session: a new inbound call, published once;
//! - anything else for an unknown session: held in order until an outbound
//!   call binds the session (the offer round-trip may still be returning),
//!   then replayed;
//! - a session whose call has ended: logged as a protocol anomaly and dropped.
//!
//! Ended sessions and unclaimed sessions are both bounded by
//! [`PhoneConfig::max_session_history`]; the oldest is forgotten first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{Call, CallContext, CallRegistry};
use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventEmitter, EventStream, PhoneEvent};
use crate::media::MediaSessionFactory;
use crate::registration::RegistrationState;
use crate::signaling::{NotificationStream, SignalingChannel, SignalingEvent, SignalingNotification};
use crate::types::{CallId, MediaConstraints, Participant, SessionId};

struct Routes {
    by_session: HashMap<SessionId, Call>,
    early: HeldNotifications,
    retired: SessionHistory,
}

impl Routes {
    fn new(config: &PhoneConfig) -> Self {
        Self {
            by_session: HashMap::new(),
            early: HeldNotifications::new(config.max_early_notifications, config.max_session_history),
            retired: SessionHistory::new(config.max_session_history),
        }
    }

    /// Forget any held notifications and drop later ones for `session`
    fn retire(&mut self, session: SessionId) {
        self.by_session.remove(&session);
        self.early.take(&session);
        self.retired.insert(session);
    }
}

/// Ended sessions, oldest forgotten first once `limit` is reached
struct SessionHistory {
    order: VecDeque<SessionId>,
    members: HashSet<SessionId>,
    limit: usize,
}

impl SessionHistory {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            limit: limit.max(1),
        }
    }

    fn contains(&self, session: &SessionId) -> bool {
        self.members.contains(session)
    }

    fn insert(&mut self, session: SessionId) {
        if !self.members.insert(session.clone()) {
            return;
        }
        self.order.push_back(session);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// Notifications for sessions no call has claimed yet
struct HeldNotifications {
    sessions: HashMap<SessionId, VecDeque<SignalingEvent>>,
    order: VecDeque<SessionId>,
    per_session: usize,
    max_sessions: usize,
}

impl HeldNotifications {
    fn new(per_session: usize, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: VecDeque::new(),
            per_session,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Hold `event` for `session`, evicting the oldest unclaimed session if
    /// too many are held
    fn hold(&mut self, session: &SessionId, event: SignalingEvent) {
        if !self.sessions.contains_key(session) {
            while self.sessions.len() >= self.max_sessions {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if let Some(dropped) = self.sessions.remove(&oldest) {
                    warn!(
                        "Forgetting {} notifications held for unclaimed session {}",
                        dropped.len(),
                        oldest
                    );
                }
            }
            self.sessions.insert(session.clone(), VecDeque::new());
            self.order.push_back(session.clone());
        }

        let limit = self.per_session;
        let Some(queue) = self.sessions.get_mut(session) else {
            return;
        };
        if queue.len() >= limit {
            warn!(
                "Dropping {} for unclaimed session {}: {} already held",
                event.name(),
                session,
                limit
            );
            return;
        }
        debug!("Holding {} for unclaimed session {}", event.name(), session);
        queue.push_back(event);
    }

    fn take(&mut self, session: &SessionId) -> Option<VecDeque<SignalingEvent>> {
        let held = self.sessions.remove(session)?;
        self.order.retain(|s| s != session);
        Some(held)
    }
}

struct PhoneInner {
    config: PhoneConfig,
    local: Participant,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaSessionFactory>,
    registration: RwLock<RegistrationState>,
    routes: Mutex<Routes>,
    calls: DashMap<CallId, Call>,
    events: EventEmitter<PhoneEvent>,
    dispatch: Mutex<Option<CancellationToken>>,
}

/// A registered endpoint that places and receives calls
#[derive(Clone)]
pub struct Phone {
    inner: Arc<PhoneInner>,
}

impl Phone {
    /// Create a phone. Nothing is sent until [`register`](Self::register).
    pub fn new(
        config: PhoneConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaSessionFactory>,
    ) -> PhoneResult<Self> {
        config.validate()?;
        let local = config.participant();
        let events = EventEmitter::new(config.event_capacity);
        let routes = Routes::new(&config);

        Ok(Self {
            inner: Arc::new(PhoneInner {
                config,
                local,
                signaling,
                media,
                registration: RwLock::new(RegistrationState::Unregistered),
                routes: Mutex::new(routes),
                calls: DashMap::new(),
                events,
                dispatch: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.inner.config
    }

    /// The participant this phone registers as
    pub fn local_participant(&self) -> &Participant {
        &self.inner.local
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.inner.registration.read()
    }

    /// Register with the signaling channel and start dispatching pushes
    ///
    /// Registering an already registered phone does nothing.
    pub async fn register(&self) -> PhoneResult<()> {
        {
            let mut registration = self.inner.registration.write();
            match *registration {
                RegistrationState::Registered => return Ok(()),
                RegistrationState::Registering => {
                    return Err(PhoneError::invalid_state("registration already in progress"))
                }
                RegistrationState::Unregistered => *registration = RegistrationState::Registering,
            }
        }
        self.inner
            .registration_changed(RegistrationState::Unregistered, RegistrationState::Registering);

        let notifications = match self.inner.signaling.register(&self.inner.local).await {
            Ok(notifications) => notifications,
            Err(err) => {
                warn!("Registration of {} failed: {}", self.inner.local, err);
                self.inner.set_registration(RegistrationState::Unregistered);
                return Err(PhoneError::Registration(err));
            }
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.dispatch.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(run_dispatch(Arc::downgrade(&self.inner), notifications, token));

        self.inner.set_registration(RegistrationState::Registered);
        info!("Registered {}", self.inner.local);
        Ok(())
    }

    /// Stop dispatching and deregister from the signaling channel
    ///
    /// Calls in progress are left alone but no longer receive pushes, and no
    /// new incoming calls are published.
    pub async fn deregister(&self) -> PhoneResult<()> {
        if self.registration_state() == RegistrationState::Unregistered {
            return Ok(());
        }
        if let Some(token) = self.inner.dispatch.lock().take() {
            token.cancel();
        }

        let result = self.inner.signaling.deregister(&self.inner.local).await;
        self.inner.set_registration(RegistrationState::Unregistered);
        match result {
            Ok(()) => {
                info!("Deregistered {}", self.inner.local);
                Ok(())
            }
            Err(err) => {
                warn!("Deregistration of {} failed: {}", self.inner.local, err);
                Err(PhoneError::Deregistration(err))
            }
        }
    }

    /// Place a call to `target`
    ///
    /// Returns immediately with a call in `initiated`; media acquisition and
    /// the offer run in the background. Failures after this point, including
    /// an unresolvable target, move the call to `error` rather than failing
    /// here. Must be called within a Tokio runtime.
    pub fn dial(&self, target: &str, constraints: Option<MediaConstraints>) -> PhoneResult<Call> {
        if !self.registration_state().accepts_dial() {
            return Err(PhoneError::NotRegistered);
        }
        let constraints = constraints.unwrap_or(self.inner.config.default_constraints);

        let call = Call::outbound(
            &self.inner.call_context(),
            self.inner.local.clone(),
            Participant::from_target(target),
            constraints,
        );
        self.inner.track(&call);
        Ok(call)
    }

    /// Calls that have not yet ended
    pub fn active_calls(&self) -> Vec<Call> {
        self.inner
            .calls
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Look up an active call
    pub fn call(&self, id: &CallId) -> Option<Call> {
        self.inner.calls.get(id).map(|entry| entry.value().clone())
    }

    /// Subscribe to phone events that have not happened yet
    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to phone events as a stream
    pub fn events(&self) -> EventStream<PhoneEvent> {
        self.inner.events.events()
    }

    /// Resolve on the next incoming call
    pub fn next_incoming(&self) -> impl Future<Output = PhoneResult<Call>> + Send + 'static {
        let next = self
            .inner
            .events
            .next_matching(|event| matches!(event, PhoneEvent::IncomingCall(_)));
        async move {
            match next.await {
                Some(PhoneEvent::IncomingCall(call)) => Ok(call),
                _ => Err(PhoneError::EventsClosed),
            }
        }
    }
}

impl std::fmt::Debug for Phone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phone")
            .field("local", &self.inner.local)
            .field("registration", &self.registration_state())
            .field("active_calls", &self.inner.calls.len())
            .finish()
    }
}

impl PhoneInner {
    fn call_context(self: &Arc<Self>) -> CallContext {
        let registry: Weak<dyn CallRegistry> = Arc::downgrade(self) as Weak<dyn CallRegistry>;
        CallContext {
            signaling: self.signaling.clone(),
            media: self.media.clone(),
            registry: Some(registry),
            event_capacity: self.config.event_capacity,
        }
    }

    fn set_registration(&self, current: RegistrationState) {
        let previous = std::mem::replace(&mut *self.registration.write(), current);
        self.registration_changed(previous, current);
    }

    fn registration_changed(&self, previous: RegistrationState, current: RegistrationState) {
        if previous != current {
            debug!("Registration {} -> {}", previous, current);
            self.events
                .emit(PhoneEvent::RegistrationChanged { previous, current });
        }
    }

    /// Add a new call to the active set
    fn track(&self, call: &Call) {
        self.calls.insert(call.id(), call.clone());
        // The call may have ended before it was inserted
        if !call.is_active() {
            self.calls.remove(&call.id());
        }
    }

    fn route(self: &Arc<Self>, notification: SignalingNotification) {
        let SignalingNotification { session_id, event } = notification;
        let mut routes = self.routes.lock();

        if routes.retired.contains(&session_id) {
            warn!(
                "Protocol anomaly: {} for ended session {}, dropping",
                event.name(),
                session_id
            );
            return;
        }

        if let Some(call) = routes.by_session.get(&session_id) {
            if !call.deliver(event) {
                debug!("Call {} no longer accepts pushes", call.id());
            }
            return;
        }

        match event {
            SignalingEvent::Offer { from, offer } => {
                let call = Call::inbound(
                    &self.call_context(),
                    self.local.clone(),
                    from,
                    session_id.clone(),
                    offer,
                    self.config.default_constraints,
                );
                routes.by_session.insert(session_id, call.clone());
                drop(routes);

                self.track(&call);
                info!("Incoming call {} from {}", call.id(), call.from());
                self.events.emit(PhoneEvent::IncomingCall(call));
            }
            other => routes.early.hold(&session_id, other),
        }
    }
}

impl CallRegistry for PhoneInner {
    fn bind_session(&self, session: &SessionId, call: &Call) {
        let mut routes = self.routes.lock();
        if !call.is_active() {
            routes.retire(session.clone());
            return;
        }

        routes.by_session.insert(session.clone(), call.clone());
        if let Some(held) = routes.early.take(session) {
            debug!("Replaying {} held notifications for session {}", held.len(), session);
            for event in held {
                call.deliver(event);
            }
        }
    }

    fn call_ended(&self, call: &Call) {
        self.calls.remove(&call.id());
        if let Some(session) = call.session_id() {
            self.routes.lock().retire(session);
        }
        debug!("Call {} removed from active set", call.id());
    }
}

impl Drop for PhoneInner {
    fn drop(&mut self) {
        if let Some(token) = self.dispatch.get_mut().take() {
            token.cancel();
        }
    }
}

/// Route pushes from one registration until cancelled or the channel closes
async fn run_dispatch(
    phone: Weak<PhoneInner>,
    mut notifications: NotificationStream,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => {
                    debug!("Signaling subscription closed");
                    break;
                }
            },
        };
        let Some(inner) = phone.upgrade() else {
            break;
        };
        inner.route(notification);
    }
    debug!("Dispatch task stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::CallEventKind;
    use crate::loopback::{LoopbackMediaEngine, Switchboard};

    async fn settle(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn ended_sessions_are_forgotten_beyond_history_bound() {
        let board = Switchboard::new();
        let media = Arc::new(LoopbackMediaEngine::new());
        let alice = Phone::new(
            PhoneConfig::new("alice").with_max_session_history(4),
            board.endpoint(),
            media.clone(),
        )
        .unwrap();
        let bob = Phone::new(
            PhoneConfig::new("bob").with_max_session_history(4),
            board.endpoint(),
            media,
        )
        .unwrap();
        alice.register().await.unwrap();
        bob.register().await.unwrap();

        for _ in 0..10 {
            let incoming = bob.next_incoming();
            let call = alice.dial("bob", None).unwrap();
            let ended = call.when(CallEventKind::Disconnected);
            incoming.await.unwrap().reject().await.unwrap();
            ended.await.unwrap();
            settle(|| alice.active_calls().is_empty()).await;
        }
        settle(|| alice.inner.routes.lock().retired.members.len() == 4).await;

        let routes = alice.inner.routes.lock();
        assert_eq!(routes.retired.members.len(), 4);
        assert_eq!(routes.retired.order.len(), 4);
        assert!(routes.by_session.is_empty());
        assert!(routes.early.sessions.is_empty());
        drop(routes);

        let routes = bob.inner.routes.lock();
        assert_eq!(routes.retired.members.len(), 4);
        assert!(routes.by_session.is_empty());
    }

    #[tokio::test]
    async fn oldest_unclaimed_session_is_evicted() {
        let board = Switchboard::new();
        let phone = Phone::new(
            PhoneConfig::new("alice")
                .with_max_session_history(2)
                .with_max_early_notifications(1),
            board.endpoint(),
            Arc::new(LoopbackMediaEngine::new()),
        )
        .unwrap();

        for n in 0..5 {
            let session = SessionId::new(format!("s-{}", n));
            phone
                .inner
                .route(SignalingNotification::new(session.clone(), SignalingEvent::Acknowledged));
            phone
                .inner
                .route(SignalingNotification::new(session, SignalingEvent::Left));
        }

        let routes = phone.inner.routes.lock();
        assert_eq!(routes.early.sessions.len(), 2);
        assert_eq!(routes.early.order.len(), 2);
        let newest = &routes.early.sessions[&SessionId::new("s-4")];
        assert_eq!(newest.iter().collect::<Vec<_>>(), vec![&SignalingEvent::Acknowledged]);
        assert!(!routes.early.sessions.contains_key(&SessionId::new("s-0")));
    }

    #[test]
    fn session_history_ignores_duplicates() {
        let mut history = SessionHistory::new(2);
        history.insert(SessionId::new("a"));
        history.insert(SessionId::new("a"));
        history.insert(SessionId::new("b"));
        assert!(history.contains(&SessionId::new("a")));

        history.insert(SessionId::new("c"));
        assert!(!history.contains(&SessionId::new("a")));
        assert!(history.contains(&SessionId::new("b")));
        assert!(history.contains(&SessionId::new("c")));
    }
}
