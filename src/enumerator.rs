//! Consumed enumeration-service surface.
//!
//! The registry core does not talk to the native audio subsystem directly;
//! it consumes a [`DeviceEnumerator`] implementation, which provides the
//! device snapshot queries and delivers raw notifications into registered
//! sinks. Platform adapters (see [`crate::platform`]) and test fakes both
//! implement this trait.

use crate::device::{
    AudioError, DataFlow, DeviceEvent, DeviceRole, DeviceState, DeviceStateMask, PropertyMap,
};
use crate::session::SessionManager;
use std::any::Any;
use std::sync::{Arc, Weak};

/// Opaque native resource backing one endpoint. Dropping the box releases
/// the underlying resource; the owning entity guarantees this happens at
/// most once.
pub type NativeHandle = Box<dyn Any + Send>;

/// A point-in-time description of one endpoint, as reported by the
/// enumeration service. Carries ownership of the endpoint's native handle;
/// a snapshot that is discarded without being adopted releases the handle
/// on drop.
pub struct DeviceSnapshot {
    pub id: String,
    pub flow: DataFlow,
    pub state: DeviceState,
    pub properties: PropertyMap,
    pub handle: Option<NativeHandle>,
}

impl std::fmt::Debug for DeviceSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSnapshot")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("state", &self.state)
            .finish()
    }
}

/// Identifies one notification registration with an enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receives raw notifications from the enumeration service.
///
/// Sinks are invoked synchronously on the enumerator's delivery thread and
/// must not re-enter [`DeviceEnumerator::register`] or
/// [`DeviceEnumerator::unregister`].
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &DeviceEvent);
}

/// Low-level device enumeration service.
///
/// Queries that have nothing to report (unknown id, no default endpoint)
/// return `Ok(None)`; `Err` is reserved for genuine subsystem failures.
pub trait DeviceEnumerator: Send + Sync {
    /// Full device snapshot restricted to a direction and state mask.
    fn enumerate(
        &self,
        flow: DataFlow,
        mask: DeviceStateMask,
    ) -> Result<Vec<DeviceSnapshot>, AudioError>;

    /// Fetch one endpoint by identifier.
    fn device(&self, device_id: &str) -> Result<Option<DeviceSnapshot>, AudioError>;

    /// The current default endpoint for a direction and role.
    fn default_endpoint(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<DeviceSnapshot>, AudioError>;

    /// The identifier of the current default endpoint for a direction and
    /// role.
    fn default_endpoint_id(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError>;

    /// Make the given endpoint the default for a role.
    fn set_default_endpoint(&self, device_id: &str, role: DeviceRole) -> Result<(), AudioError>;

    /// Load the property mapping for an endpoint.
    fn load_properties(&self, device_id: &str) -> Result<PropertyMap, AudioError>;

    /// The session manager for an endpoint, or `None` when the endpoint
    /// does not carry sessions (wrong direction, inactive, or unsupported
    /// by the backend).
    fn session_manager(&self, device_id: &str)
        -> Result<Option<Arc<SessionManager>>, AudioError>;

    /// Register a notification sink. The sink is held weakly; a dropped
    /// subscriber resolves to a no-op delivery.
    fn register(&self, sink: Weak<dyn NotificationSink>) -> SubscriptionId;

    /// Remove a previously registered sink. Unknown ids are ignored.
    fn unregister(&self, subscription: SubscriptionId);
}
