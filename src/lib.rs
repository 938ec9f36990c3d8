//! Audio Endpoint Registry
//!
//! An event-driven, collection-consistent view of a host's audio endpoints
//! and their per-role default assignments, built atop a callback-driven
//! enumeration service.
//!
//! ## Features
//!
//! - Filtered device collections scoped to one direction and state mask,
//!   reconciled in place against raw add/remove/state/property/default
//!   notifications
//! - A unified registry exposing the full device list, the four canonical
//!   defaults (render/capture x multimedia/communications), and an
//!   aggregate session view across active render devices
//! - Persisted per-process default-endpoint policy, with graceful
//!   degradation when the native policy object cannot be activated
//! - Deterministic, idempotent teardown of every native handle, safe under
//!   concurrent notification delivery
//!
//! The core is platform-independent and consumes the
//! [`enumerator::DeviceEnumerator`] trait; a Windows adapter lives in
//! [`platform::wasapi`].

pub mod device;
pub mod devices;
pub mod enumerator;
pub mod platform;
pub mod policy;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use device::{
    AudioDevice, AudioError, DataFlow, DefaultDeviceId, DeviceEvent, DeviceRole, DeviceState,
    DeviceStateMask, PropertyMap,
};
pub use devices::DeviceCollection;
pub use enumerator::{DeviceEnumerator, DeviceSnapshot, NotificationSink, SubscriptionId};
pub use policy::{PolicyBackend, PolicyConfig};
pub use registry::AudioRegistry;
pub use session::{AudioSession, DisconnectReason, SessionManager, SessionState};
