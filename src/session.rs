//! Audio session entities and per-device session managers.
//!
//! A session represents one audio stream bound to an endpoint. Sessions are
//! announced by the backend through the device's [`SessionManager`]; they
//! terminate on disconnect and become inert, with no explicit removal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::enumerator::SubscriptionId;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_subscription_id() -> SubscriptionId {
    SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
}

/// Stream state of one audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session has an open, playing stream
    Active,

    /// The session has an open stream that is not playing
    Inactive,

    /// The session's streams were all closed
    Expired,

    /// The session was terminated; see its disconnect reason
    Disconnected,
}

/// Why a session was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DeviceRemoved,
    ServerShutdown,
    FormatChanged,
    SessionLogoff,
    SessionDisconnected,
    ExclusiveModeOverride,
}

/// Observes state transitions on one session.
pub trait SessionObserver: Send + Sync {
    fn session_state_changed(&self, device_id: &str, state: SessionState);
    fn session_disconnected(&self, device_id: &str, reason: DisconnectReason);
}

/// Notified when a device's session manager announces a new session.
pub trait SessionCreatedSink: Send + Sync {
    fn session_created(&self, device_id: &str, session: &Arc<AudioSession>);
}

/// One audio stream bound to a device.
///
/// Backends drive the state machine through [`AudioSession::set_state`] and
/// [`AudioSession::disconnect`]; after a disconnect the session is inert and
/// ignores further transitions.
pub struct AudioSession {
    device_id: String,
    state: Mutex<SessionState>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    observers: Mutex<Vec<(SubscriptionId, Weak<dyn SessionObserver>)>>,
}

impl AudioSession {
    fn new(device_id: String, state: SessionState) -> Self {
        Self {
            device_id,
            state: Mutex::new(state),
            disconnect_reason: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Identifier of the device this session is bound to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// The reason the session terminated, once disconnected.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock().unwrap()
    }

    /// Register an observer. Observers are held weakly; a dropped observer
    /// is pruned on the next delivery.
    pub fn subscribe(&self, observer: Weak<dyn SessionObserver>) -> SubscriptionId {
        let id = next_subscription_id();
        self.observers.lock().unwrap().push((id, observer));
        id
    }

    /// Remove a previously registered observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.observers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != subscription);
    }

    /// Apply a stream-state transition and notify observers. Ignored once
    /// the session is disconnected.
    pub fn set_state(&self, state: SessionState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == SessionState::Disconnected {
                debug!(device_id = %self.device_id, ?state, "ignoring transition on disconnected session");
                return;
            }
            *current = state;
        }
        for observer in self.live_observers() {
            observer.session_state_changed(&self.device_id, state);
        }
    }

    /// Terminate the session. Observers are notified once; repeated calls
    /// are ignored.
    pub fn disconnect(&self, reason: DisconnectReason) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == SessionState::Disconnected {
                return;
            }
            *current = SessionState::Disconnected;
            *self.disconnect_reason.lock().unwrap() = Some(reason);
        }
        for observer in self.live_observers() {
            observer.session_disconnected(&self.device_id, reason);
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|(_, weak)| weak.strong_count() > 0);
        observers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

impl std::fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSession")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the sessions of one endpoint device.
///
/// Present on a device only while it is active and its direction carries
/// sessions. The backend announces new sessions through
/// [`SessionManager::create_session`].
pub struct SessionManager {
    device_id: String,
    sessions: Mutex<Vec<Arc<AudioSession>>>,
    created_sinks: Mutex<Vec<(SubscriptionId, Weak<dyn SessionCreatedSink>)>>,
}

impl SessionManager {
    pub fn new(device_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            sessions: Mutex::new(Vec::new()),
            created_sinks: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Snapshot of the current sessions, in discovery order.
    pub fn sessions(&self) -> Vec<Arc<AudioSession>> {
        self.sessions.lock().unwrap().clone()
    }

    /// Announce a new session on this device and notify created-sinks.
    pub fn create_session(&self, initial_state: SessionState) -> Arc<AudioSession> {
        let session = Arc::new(AudioSession::new(self.device_id.clone(), initial_state));
        self.sessions.lock().unwrap().push(session.clone());

        let sinks: Vec<Arc<dyn SessionCreatedSink>> = {
            let mut sinks = self.created_sinks.lock().unwrap();
            sinks.retain(|(_, weak)| weak.strong_count() > 0);
            sinks.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for sink in sinks {
            sink.session_created(&self.device_id, &session);
        }
        session
    }

    /// Register a sink for newly announced sessions.
    pub fn subscribe_created(&self, sink: Weak<dyn SessionCreatedSink>) -> SubscriptionId {
        let id = next_subscription_id();
        self.created_sinks.lock().unwrap().push((id, sink));
        id
    }

    /// Remove a previously registered created-sink. Unknown ids are ignored.
    pub fn unsubscribe_created(&self, subscription: SubscriptionId) {
        self.created_sinks
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != subscription);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device_id", &self.device_id)
            .field("sessions", &self.sessions.lock().unwrap().len())
            .finish()
    }
}
