//! Test doubles for the enumeration and policy services.
//!
//! `FakeEnumerator` is a scriptable in-memory backend: tests mutate its
//! device table and replay raw notifications against collections and the
//! registry. Every snapshot it hands out carries a drop-tracking handle so
//! tests can assert that native resources are released exactly once.

use crate::device::{
    AudioError, DataFlow, DeviceEvent, DeviceRole, DeviceState, DeviceStateMask, PropertyMap,
};
use crate::enumerator::{
    DeviceEnumerator, DeviceSnapshot, NotificationSink, SubscriptionId,
};
use crate::policy::PolicyBackend;
use crate::session::{next_subscription_id, SessionManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, Weak};

/// Install the tracing subscriber once per test binary; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collect everything currently queued on an event receiver.
pub fn drain(receiver: &Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Default)]
struct HandleStats {
    created: AtomicUsize,
    released: AtomicUsize,
}

/// Handle embedded in every snapshot; its drop is the "native release".
struct TrackedHandle {
    stats: Arc<HandleStats>,
}

impl Drop for TrackedHandle {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeDevice {
    flow: DataFlow,
    state: DeviceState,
    properties: PropertyMap,
    stats: Arc<HandleStats>,
}

/// In-memory [`DeviceEnumerator`] with scriptable device truth and manual
/// notification delivery.
pub struct FakeEnumerator {
    devices: Mutex<HashMap<String, FakeDevice>>,
    order: Mutex<Vec<String>>,
    defaults: Mutex<HashMap<(DataFlow, DeviceRole), String>>,
    managers: Mutex<HashMap<String, Arc<SessionManager>>>,
    sinks: Mutex<Vec<(SubscriptionId, Weak<dyn NotificationSink>)>>,
    stats: Mutex<HashMap<String, Arc<HandleStats>>>,
}

impl FakeEnumerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            defaults: Mutex::new(HashMap::new()),
            managers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_device(&self, id: &str, flow: DataFlow, state: DeviceState) {
        let stats = self
            .stats
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone();
        self.devices.lock().unwrap().insert(
            id.to_string(),
            FakeDevice {
                flow,
                state,
                properties: PropertyMap::new(),
                stats,
            },
        );
        let mut order = self.order.lock().unwrap();
        if !order.iter().any(|existing| existing == id) {
            order.push(id.to_string());
        }
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.lock().unwrap().remove(id);
        self.order.lock().unwrap().retain(|existing| existing != id);
    }

    pub fn set_device_state(&self, id: &str, state: DeviceState) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.state = state;
        }
    }

    pub fn set_device_flow(&self, id: &str, flow: DataFlow) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.flow = flow;
        }
    }

    pub fn set_device_property(&self, id: &str, key: &str, value: &str) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.properties.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_default(&self, flow: DataFlow, role: DeviceRole, id: &str) {
        self.defaults
            .lock()
            .unwrap()
            .insert((flow, role), id.to_string());
    }

    pub fn set_session_manager(&self, id: &str, manager: Arc<SessionManager>) {
        self.managers.lock().unwrap().insert(id.to_string(), manager);
    }

    /// Deliver a raw notification to every registered sink, in registration
    /// order, the way the native subsystem invokes its callbacks.
    pub fn notify(&self, event: DeviceEvent) {
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let mut sinks = self.sinks.lock().unwrap();
            sinks.retain(|(_, weak)| weak.strong_count() > 0);
            sinks.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for sink in sinks {
            sink.notify(&event);
        }
    }

    pub fn sink_count(&self) -> usize {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|(_, weak)| weak.strong_count() > 0);
        sinks.len()
    }

    /// Number of native handles handed out for a device id.
    pub fn handles_created(&self, id: &str) -> usize {
        self.stats
            .lock()
            .unwrap()
            .get(id)
            .map(|stats| stats.created.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of those handles released so far.
    pub fn handles_released(&self, id: &str) -> usize {
        self.stats
            .lock()
            .unwrap()
            .get(id)
            .map(|stats| stats.released.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn snapshot(&self, id: &str, device: &FakeDevice) -> DeviceSnapshot {
        device.stats.created.fetch_add(1, Ordering::SeqCst);
        DeviceSnapshot {
            id: id.to_string(),
            flow: device.flow,
            state: device.state,
            properties: device.properties.clone(),
            handle: Some(Box::new(TrackedHandle {
                stats: device.stats.clone(),
            })),
        }
    }
}

impl DeviceEnumerator for FakeEnumerator {
    fn enumerate(
        &self,
        flow: DataFlow,
        mask: DeviceStateMask,
    ) -> Result<Vec<DeviceSnapshot>, AudioError> {
        let devices = self.devices.lock().unwrap();
        let order = self.order.lock().unwrap();
        Ok(order
            .iter()
            .filter_map(|id| devices.get(id).map(|device| (id, device)))
            .filter(|(_, device)| flow == DataFlow::All || device.flow == flow)
            .filter(|(_, device)| mask.contains(device.state))
            .map(|(id, device)| self.snapshot(id, device))
            .collect())
    }

    fn device(&self, device_id: &str) -> Result<Option<DeviceSnapshot>, AudioError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .get(device_id)
            .map(|device| self.snapshot(device_id, device)))
    }

    fn default_endpoint(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<DeviceSnapshot>, AudioError> {
        match self.default_endpoint_id(flow, role)? {
            Some(id) => self.device(&id),
            None => Ok(None),
        }
    }

    fn default_endpoint_id(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError> {
        Ok(self.defaults.lock().unwrap().get(&(flow, role)).cloned())
    }

    fn set_default_endpoint(&self, device_id: &str, role: DeviceRole) -> Result<(), AudioError> {
        let flow = self
            .devices
            .lock()
            .unwrap()
            .get(device_id)
            .map(|device| device.flow)
            .ok_or_else(|| AudioError::DeviceNotFound {
                device_id: device_id.to_string(),
            })?;
        self.defaults
            .lock()
            .unwrap()
            .insert((flow, role), device_id.to_string());
        Ok(())
    }

    fn load_properties(&self, device_id: &str) -> Result<PropertyMap, AudioError> {
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .map(|device| device.properties.clone())
            .ok_or_else(|| AudioError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    fn session_manager(
        &self,
        device_id: &str,
    ) -> Result<Option<Arc<SessionManager>>, AudioError> {
        Ok(self.managers.lock().unwrap().get(device_id).cloned())
    }

    fn register(&self, sink: Weak<dyn NotificationSink>) -> SubscriptionId {
        let id = next_subscription_id();
        self.sinks.lock().unwrap().push((id, sink));
        id
    }

    fn unregister(&self, subscription: SubscriptionId) {
        self.sinks
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != subscription);
    }
}

/// In-memory [`PolicyBackend`] with a release counter.
#[derive(Clone)]
pub struct FakePolicyBackend {
    store: Arc<Mutex<HashMap<(u32, DataFlow, DeviceRole), String>>>,
    releases: Arc<AtomicUsize>,
}

impl FakePolicyBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many boxed instances have been dropped so far.
    pub fn releases(&self) -> usize {
        // The test's own clone is still alive, so this counts only the
        // instances the service released.
        self.releases.load(Ordering::SeqCst)
    }
}

impl Drop for FakePolicyBackend {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl PolicyBackend for FakePolicyBackend {
    fn persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .get(&(process_id, flow, role))
            .cloned())
    }

    fn set_persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<&str>,
    ) -> Result<(), AudioError> {
        let mut store = self.store.lock().unwrap();
        match device_id {
            Some(id) => {
                store.insert((process_id, flow, role), id.to_string());
            }
            None => {
                store.remove(&(process_id, flow, role));
            }
        }
        Ok(())
    }

    fn clear_all_persisted(&self) -> Result<(), AudioError> {
        self.store.lock().unwrap().clear();
        Ok(())
    }
}
