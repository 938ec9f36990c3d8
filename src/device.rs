//! Audio device data model.
//!
//! Defines the core data structures for representing audio endpoint devices,
//! their state, per-role default identity, and the events relayed to
//! subscribers.

use crate::enumerator::{DeviceSnapshot, NativeHandle};
use crate::session::{DisconnectReason, SessionManager, SessionState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Data-flow direction of an audio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFlow {
    /// Output devices (speakers, headphones)
    Render,

    /// Input devices (microphones, line-in)
    Capture,

    /// Both directions; valid for enumeration queries only, never for a
    /// filtered collection
    All,
}

/// Default-device role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Games, system sounds, voice commands
    Console,

    /// Music players, video players
    Multimedia,

    /// VoIP applications (Teams, Zoom, Discord)
    Communications,
}

/// Lifecycle state of an audio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device is active and available for use
    Active,

    /// Device is disabled in the host's sound settings
    Disabled,

    /// Device is not present (driver issue)
    NotPresent,

    /// Device is unplugged (for pluggable devices)
    Unplugged,
}

impl DeviceState {
    /// The single-state mask corresponding to this state.
    pub fn mask(self) -> DeviceStateMask {
        match self {
            DeviceState::Active => DeviceStateMask::ACTIVE,
            DeviceState::Disabled => DeviceStateMask::DISABLED,
            DeviceState::NotPresent => DeviceStateMask::NOT_PRESENT,
            DeviceState::Unplugged => DeviceStateMask::UNPLUGGED,
        }
    }
}

/// Bitmask over [`DeviceState`] values, used to scope enumeration queries
/// and filtered collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStateMask(pub u32);

impl DeviceStateMask {
    pub const ACTIVE: Self = Self(0x1);
    pub const DISABLED: Self = Self(0x2);
    pub const NOT_PRESENT: Self = Self(0x4);
    pub const UNPLUGGED: Self = Self(0x8);
    pub const ALL: Self = Self(0xF);

    /// True if the mask includes the given state.
    pub fn contains(self, state: DeviceState) -> bool {
        self.0 & state.mask().0 != 0
    }

    /// True if the given state is exactly this mask. Membership in a
    /// filtered collection requires exact equality, not inclusion.
    pub fn is_exactly(self, state: DeviceState) -> bool {
        self == state.mask()
    }
}

impl std::ops::BitOr for DeviceStateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-device metadata, keyed by property name.
pub type PropertyMap = HashMap<String, String>;

/// Well-known property key for the device's human-readable name.
pub const PKEY_DEVICE_FRIENDLY_NAME: &str = "Device.FriendlyName";

/// Per-role default endpoint identifiers for one data-flow direction.
///
/// An identifier held here should correspond to a device currently present
/// in the associated collection, but transient staleness is tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultDeviceId {
    pub communications: Option<String>,
    pub console: Option<String>,
    pub multimedia: Option<String>,
}

impl DefaultDeviceId {
    /// True iff `device_id` equals any of the stored identifiers. Unset
    /// fields never match.
    pub fn is_default(&self, device_id: &str) -> bool {
        self.communications.as_deref() == Some(device_id)
            || self.console.as_deref() == Some(device_id)
            || self.multimedia.as_deref() == Some(device_id)
    }

    /// The identifier stored for a role, if any.
    pub fn role(&self, role: DeviceRole) -> Option<&str> {
        match role {
            DeviceRole::Communications => self.communications.as_deref(),
            DeviceRole::Console => self.console.as_deref(),
            DeviceRole::Multimedia => self.multimedia.as_deref(),
        }
    }

    /// Replace the identifier stored for a role.
    pub fn set_role(&mut self, role: DeviceRole, device_id: Option<String>) {
        match role {
            DeviceRole::Communications => self.communications = device_id,
            DeviceRole::Console => self.console = device_id,
            DeviceRole::Multimedia => self.multimedia = device_id,
        }
    }
}

/// One audio endpoint device.
///
/// The identifier and data-flow direction are fixed at construction; state
/// and the property cache are updated in place as notifications arrive. The
/// entity owns an opaque native handle which is released exactly once,
/// either by [`AudioDevice::release`] or when the last owner drops it.
pub struct AudioDevice {
    id: String,
    flow: DataFlow,
    state: Mutex<DeviceState>,
    properties: Mutex<PropertyMap>,
    sessions: Mutex<Option<Arc<SessionManager>>>,
    handle: Mutex<Option<NativeHandle>>,
}

impl AudioDevice {
    /// Adopt an enumerator snapshot, taking ownership of its native handle.
    pub fn from_snapshot(snapshot: DeviceSnapshot) -> Self {
        Self {
            id: snapshot.id,
            flow: snapshot.flow,
            state: Mutex::new(snapshot.state),
            properties: Mutex::new(snapshot.properties),
            sessions: Mutex::new(None),
            handle: Mutex::new(snapshot.handle),
        }
    }

    /// Stable, opaque identifier. Never changes for the life of the entity.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flow(&self) -> DataFlow {
        self.flow
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    /// Update the lifecycle state in place.
    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    /// Look up a cached property value.
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    /// Human-readable device name, if the property cache holds one.
    pub fn friendly_name(&self) -> Option<String> {
        self.property(PKEY_DEVICE_FRIENDLY_NAME)
    }

    /// Replace the property cache with a freshly loaded mapping.
    pub fn store_properties(&self, properties: PropertyMap) {
        *self.properties.lock().unwrap() = properties;
    }

    /// The session manager, present only while the device is active and its
    /// direction is session-relevant.
    pub fn session_manager(&self) -> Option<Arc<SessionManager>> {
        self.sessions.lock().unwrap().clone()
    }

    pub(crate) fn attach_session_manager(&self, manager: Arc<SessionManager>) {
        *self.sessions.lock().unwrap() = Some(manager);
    }

    pub(crate) fn detach_session_manager(&self) -> Option<Arc<SessionManager>> {
        self.sessions.lock().unwrap().take()
    }

    /// Release the native handle. Idempotent; dropping the entity releases
    /// the handle if this was never called.
    pub fn release(&self) {
        drop(self.handle.lock().unwrap().take());
        self.detach_session_manager();
    }
}

impl std::fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDevice")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("state", &self.state())
            .finish()
    }
}

/// Events relayed by collections and the registry. The same enum carries the
/// raw notifications delivered by the enumerator backend; the session
/// variants are emitted by the registry only.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A new audio device was reported by the subsystem
    DeviceAdded { device_id: String },

    /// An audio device was removed
    DeviceRemoved { device_id: String },

    /// Device lifecycle state changed
    StateChanged {
        device_id: String,
        state: DeviceState,
    },

    /// A device property value changed
    PropertyChanged { device_id: String, key: String },

    /// Default device changed for a direction and role. `device_id` is
    /// `None` when no default remains.
    DefaultChanged {
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<String>,
    },

    /// An audio session changed stream state
    SessionStateChanged {
        device_id: String,
        state: SessionState,
    },

    /// An audio session was disconnected
    SessionDisconnected {
        device_id: String,
        reason: DisconnectReason,
    },
}

/// Audio registry error types.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("a filtered device collection requires a concrete data flow")]
    UnsupportedDataFlow,

    #[error("native audio subsystem call failed")]
    Native(#[from] anyhow::Error),
}
