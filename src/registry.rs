//! Unified audio registry.
//!
//! [`AudioRegistry`] composes an unfiltered device set (all directions, all
//! states) with the persisted-policy service. It exposes the full device
//! list, the four canonical defaults (render/capture × multimedia and
//! communications), and an aggregate session view across active render
//! devices, and relays collection-consistent events to subscribers.

use crate::device::{
    AudioDevice, DataFlow, DeviceEvent, DeviceRole, DeviceState, DeviceStateMask,
};
use crate::devices::EventRelay;
use crate::enumerator::{DeviceEnumerator, NotificationSink, SubscriptionId};
use crate::policy::PolicyConfig;
use crate::session::{
    AudioSession, DisconnectReason, SessionCreatedSink, SessionManager, SessionObserver,
    SessionState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, warn};

/// The four canonical default-device references.
#[derive(Default)]
struct CanonicalDefaults {
    multimedia_capture: Option<Arc<AudioDevice>>,
    communications_capture: Option<Arc<AudioDevice>>,
    multimedia_render: Option<Arc<AudioDevice>>,
    communications_render: Option<Arc<AudioDevice>>,
}

impl CanonicalDefaults {
    fn slot(&mut self, flow: DataFlow, role: DeviceRole) -> Option<&mut Option<Arc<AudioDevice>>> {
        match (flow, role) {
            (DataFlow::Capture, DeviceRole::Multimedia) => Some(&mut self.multimedia_capture),
            (DataFlow::Capture, DeviceRole::Communications) => {
                Some(&mut self.communications_capture)
            }
            (DataFlow::Render, DeviceRole::Multimedia) => Some(&mut self.multimedia_render),
            (DataFlow::Render, DeviceRole::Communications) => {
                Some(&mut self.communications_render)
            }
            _ => None,
        }
    }
}

/// Subscriptions held against one device's session manager and sessions,
/// keyed by device id in the registry's wiring table so eviction and
/// disposal can unsubscribe explicitly.
struct SessionWiring {
    manager: Arc<SessionManager>,
    created_sub: SubscriptionId,
    session_subs: Vec<(Arc<AudioSession>, SubscriptionId)>,
}

struct RegistryInner {
    enumerator: Arc<dyn DeviceEnumerator>,
    devices: Mutex<Vec<Arc<AudioDevice>>>,
    defaults: Mutex<CanonicalDefaults>,
    policy: PolicyConfig,
    wiring: Mutex<HashMap<String, SessionWiring>>,
    events: EventRelay,
    subscription: Mutex<Option<SubscriptionId>>,
    closed: AtomicBool,
    // Needed to hand session managers a weak reference back to us from
    // handlers that only see &self.
    self_weak: OnceLock<Weak<RegistryInner>>,
}

/// Consistent, event-driven view of every audio endpoint on the host.
pub struct AudioRegistry {
    inner: Arc<RegistryInner>,
}

impl AudioRegistry {
    /// Enumerate the full device set, wire session observers for active
    /// devices, resolve the canonical defaults, and register for
    /// notifications.
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        policy: PolicyConfig,
    ) -> Result<Self, crate::AudioError> {
        let devices: Vec<Arc<AudioDevice>> = enumerator
            .enumerate(DataFlow::All, DeviceStateMask::ALL)?
            .into_iter()
            .map(|snapshot| Arc::new(AudioDevice::from_snapshot(snapshot)))
            .collect();

        let inner = Arc::new(RegistryInner {
            enumerator: enumerator.clone(),
            devices: Mutex::new(devices),
            defaults: Mutex::new(CanonicalDefaults::default()),
            policy,
            wiring: Mutex::new(HashMap::new()),
            events: EventRelay::new(),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));

        for device in inner.devices.lock().unwrap().clone() {
            if device.state() == DeviceState::Active {
                inner.wire_sessions(&device);
            }
        }

        // Eager default resolution; a lookup miss leaves the slot unset.
        {
            let mut defaults = inner.defaults.lock().unwrap();
            for (flow, role) in [
                (DataFlow::Capture, DeviceRole::Multimedia),
                (DataFlow::Capture, DeviceRole::Communications),
                (DataFlow::Render, DeviceRole::Multimedia),
                (DataFlow::Render, DeviceRole::Communications),
            ] {
                if let Ok(Some(id)) = enumerator.default_endpoint_id(flow, role) {
                    if let Some(device) = inner.find_device(&id) {
                        if let Some(slot) = defaults.slot(flow, role) {
                            *slot = Some(device);
                        }
                    }
                }
            }
        }

        let subscription =
            enumerator.register(Arc::downgrade(&inner) as Weak<dyn NotificationSink>);
        *inner.subscription.lock().unwrap() = Some(subscription);

        Ok(Self { inner })
    }

    /// Snapshot of every device, in discovery order.
    pub fn devices(&self) -> Vec<Arc<AudioDevice>> {
        self.inner.devices.lock().unwrap().clone()
    }

    /// Look up a device by identifier.
    pub fn device(&self, device_id: &str) -> Option<Arc<AudioDevice>> {
        self.inner.find_device(device_id)
    }

    /// Capture devices, computed from the current member set at call time.
    pub fn capture_devices(&self) -> Vec<Arc<AudioDevice>> {
        self.devices_with_flow(DataFlow::Capture)
    }

    /// Render devices, computed from the current member set at call time.
    pub fn render_devices(&self) -> Vec<Arc<AudioDevice>> {
        self.devices_with_flow(DataFlow::Render)
    }

    fn devices_with_flow(&self, flow: DataFlow) -> Vec<Arc<AudioDevice>> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.flow() == flow)
            .cloned()
            .collect()
    }

    /// Every session of every active render device, concatenated in device
    /// order. Devices without a session manager contribute nothing.
    pub fn render_sessions(&self) -> Vec<Arc<AudioSession>> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.flow() == DataFlow::Render && d.state() == DeviceState::Active)
            .filter_map(|d| d.session_manager())
            .flat_map(|manager| manager.sessions())
            .collect()
    }

    pub fn default_multimedia_capture(&self) -> Option<Arc<AudioDevice>> {
        self.inner.defaults.lock().unwrap().multimedia_capture.clone()
    }

    pub fn default_communications_capture(&self) -> Option<Arc<AudioDevice>> {
        self.inner
            .defaults
            .lock()
            .unwrap()
            .communications_capture
            .clone()
    }

    pub fn default_multimedia_render(&self) -> Option<Arc<AudioDevice>> {
        self.inner.defaults.lock().unwrap().multimedia_render.clone()
    }

    pub fn default_communications_render(&self) -> Option<Arc<AudioDevice>> {
        self.inner
            .defaults
            .lock()
            .unwrap()
            .communications_render
            .clone()
    }

    /// Make a device the system default for a role. Pass-through to the
    /// enumeration service.
    pub fn set_default_endpoint(
        &self,
        device_id: &str,
        role: DeviceRole,
    ) -> Result<(), crate::AudioError> {
        self.inner.enumerator.set_default_endpoint(device_id, role)
    }

    /// The persisted per-process policy service.
    pub fn policy(&self) -> &PolicyConfig {
        &self.inner.policy
    }

    /// Subscribe to relayed device and session events.
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Release every device, close the policy service, and drop the
    /// enumerator subscription, in that order. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for AudioRegistry {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl RegistryInner {
    fn find_device(&self, device_id: &str) -> Option<Arc<AudioDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id() == device_id)
            .cloned()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for device in self.devices.lock().unwrap().drain(..) {
            self.unwire_sessions(&device);
            device.release();
        }
        {
            let mut defaults = self.defaults.lock().unwrap();
            *defaults = CanonicalDefaults::default();
        }
        self.policy.close();
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            self.enumerator.unregister(subscription);
        }
    }

    fn self_weak(&self) -> Weak<RegistryInner> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    /// Attach the device's session manager (if the backend reports one) and
    /// subscribe to its current sessions and future announcements.
    fn wire_sessions(&self, device: &Arc<AudioDevice>) {
        let manager = match self.enumerator.session_manager(device.id()) {
            Ok(Some(manager)) => manager,
            Ok(None) => return,
            Err(err) => {
                warn!(device_id = device.id(), error = %err, "session manager lookup failed");
                return;
            }
        };

        device.attach_session_manager(manager.clone());

        let created_sub =
            manager.subscribe_created(self.self_weak() as Weak<dyn SessionCreatedSink>);
        let session_subs = manager
            .sessions()
            .into_iter()
            .map(|session| {
                let sub = session.subscribe(self.self_weak() as Weak<dyn SessionObserver>);
                (session, sub)
            })
            .collect();

        self.wiring.lock().unwrap().insert(
            device.id().to_string(),
            SessionWiring {
                manager,
                created_sub,
                session_subs,
            },
        );
    }

    /// Drop every subscription held against the device's sessions and
    /// detach its manager.
    fn unwire_sessions(&self, device: &Arc<AudioDevice>) {
        if let Some(wiring) = self.wiring.lock().unwrap().remove(device.id()) {
            wiring.manager.unsubscribe_created(wiring.created_sub);
            for (session, sub) in wiring.session_subs {
                session.unsubscribe(sub);
            }
        }
        device.detach_session_manager();
    }

    fn on_device_added(&self, device_id: &str) {
        if self.find_device(device_id).is_some() {
            return;
        }

        let snapshot = match self.enumerator.device(device_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(err) => {
                warn!(device_id, error = %err, "device fetch failed during add");
                return;
            }
        };

        let device = Arc::new(AudioDevice::from_snapshot(snapshot));
        if device.state() == DeviceState::Active {
            self.wire_sessions(&device);
        }

        let mut devices = self.devices.lock().unwrap();
        if devices.iter().any(|d| d.id() == device_id) {
            return;
        }
        devices.push(device);
        drop(devices);

        self.events.emit(DeviceEvent::DeviceAdded {
            device_id: device_id.to_string(),
        });
    }

    fn on_device_removed(&self, device_id: &str) {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            devices
                .iter()
                .position(|d| d.id() == device_id)
                .map(|index| devices.remove(index))
        };

        if let Some(device) = removed {
            self.unwire_sessions(&device);
            device.release();
            self.events.emit(DeviceEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        }
    }

    fn on_state_changed(&self, device_id: &str, state: DeviceState) {
        if let Some(device) = self.find_device(device_id) {
            device.set_state(state);
            let wired = self.wiring.lock().unwrap().contains_key(device_id);
            if state == DeviceState::Active && !wired {
                self.wire_sessions(&device);
            } else if state != DeviceState::Active && wired {
                self.unwire_sessions(&device);
            }
        } else {
            debug!(device_id, "state change for unknown device");
        }

        // Relayed even when the device is not a member.
        self.events.emit(DeviceEvent::StateChanged {
            device_id: device_id.to_string(),
            state,
        });
    }

    fn on_property_changed(&self, device_id: &str, key: &str) {
        if let Some(device) = self.find_device(device_id) {
            match self.enumerator.load_properties(device_id) {
                Ok(properties) => device.store_properties(properties),
                Err(err) => {
                    warn!(device_id, error = %err, "property reload failed");
                }
            }
        }

        self.events.emit(DeviceEvent::PropertyChanged {
            device_id: device_id.to_string(),
            key: key.to_string(),
        });
    }

    fn on_default_changed(&self, flow: DataFlow, role: DeviceRole, device_id: Option<&str>) {
        // Re-resolve against the current member set; a miss leaves the
        // previous reference unchanged.
        if let Some(id) = device_id {
            if let Some(device) = self.find_device(id) {
                if let Some(slot) = self.defaults.lock().unwrap().slot(flow, role) {
                    *slot = Some(device);
                }
            }
        }

        self.events.emit(DeviceEvent::DefaultChanged {
            flow,
            role,
            device_id: device_id.map(String::from),
        });
    }
}

impl NotificationSink for RegistryInner {
    fn notify(&self, event: &DeviceEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            DeviceEvent::DeviceAdded { device_id } => self.on_device_added(device_id),
            DeviceEvent::DeviceRemoved { device_id } => self.on_device_removed(device_id),
            DeviceEvent::StateChanged { device_id, state } => {
                self.on_state_changed(device_id, *state)
            }
            DeviceEvent::PropertyChanged { device_id, key } => {
                self.on_property_changed(device_id, key)
            }
            DeviceEvent::DefaultChanged {
                flow,
                role,
                device_id,
            } => self.on_default_changed(*flow, *role, device_id.as_deref()),
            // Session events never originate from the enumerator.
            _ => {}
        }
    }
}

impl SessionCreatedSink for RegistryInner {
    fn session_created(&self, device_id: &str, session: &Arc<AudioSession>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let sub = session.subscribe(self.self_weak() as Weak<dyn SessionObserver>);
        if let Some(wiring) = self.wiring.lock().unwrap().get_mut(device_id) {
            wiring.session_subs.push((session.clone(), sub));
        }
    }
}

impl SessionObserver for RegistryInner {
    fn session_state_changed(&self, device_id: &str, state: SessionState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.events.emit(DeviceEvent::SessionStateChanged {
            device_id: device_id.to_string(),
            state,
        });
    }

    fn session_disconnected(&self, device_id: &str, reason: DisconnectReason) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Disconnect mutates no collection state; the session goes inert.
        self.events.emit(DeviceEvent::SessionDisconnected {
            device_id: device_id.to_string(),
            reason,
        });
    }
}
