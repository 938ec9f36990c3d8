//! Filtered device collections.
//!
//! A [`DeviceCollection`] is an ordered set of devices restricted to one
//! data-flow direction and one state mask, kept in sync with the
//! enumerator's notification stream. Members are admitted, evicted, and
//! refreshed in place; the collection also tracks the per-role default
//! endpoint identity for its direction.

use crate::device::{
    AudioDevice, DataFlow, DefaultDeviceId, DeviceEvent, DeviceRole, DeviceStateMask,
};
use crate::enumerator::{DeviceEnumerator, NotificationSink, SubscriptionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Fan-out of relayed events to any number of channel subscribers. Senders
/// whose receiver hung up are pruned on the next emit.
pub(crate) struct EventRelay {
    senders: Mutex<Vec<Sender<DeviceEvent>>>,
}

impl EventRelay {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        self.senders
            .lock()
            .unwrap()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub(crate) fn emit_all(&self, events: Vec<DeviceEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

struct CollectionInner {
    enumerator: Arc<dyn DeviceEnumerator>,
    flow: DataFlow,
    mask: DeviceStateMask,
    items: Mutex<Vec<Arc<AudioDevice>>>,
    defaults: Mutex<DefaultDeviceId>,
    events: EventRelay,
    subscription: Mutex<Option<SubscriptionId>>,
    closed: AtomicBool,
}

/// An ordered, live view of the devices matching one direction and state
/// mask.
///
/// The view owns its members: a device leaving the view is released, and
/// closing the view releases every member and the enumerator subscription.
pub struct DeviceCollection {
    inner: Arc<CollectionInner>,
}

impl DeviceCollection {
    /// Build a view over `(flow, mask)`, adopt the enumerator's current
    /// snapshot, resolve the per-role defaults for `flow`, and register for
    /// notifications.
    ///
    /// Fails fast with [`crate::AudioError::UnsupportedDataFlow`] when `flow`
    /// is [`DataFlow::All`]; a filtered view must pick one direction.
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        flow: DataFlow,
        mask: DeviceStateMask,
    ) -> Result<Self, crate::AudioError> {
        if flow == DataFlow::All {
            return Err(crate::AudioError::UnsupportedDataFlow);
        }

        let items = enumerator
            .enumerate(flow, mask)?
            .into_iter()
            .map(|snapshot| Arc::new(AudioDevice::from_snapshot(snapshot)))
            .collect();

        // A missing or failed default lookup leaves the field unset.
        let mut defaults = DefaultDeviceId::default();
        for role in [
            DeviceRole::Communications,
            DeviceRole::Console,
            DeviceRole::Multimedia,
        ] {
            if let Ok(Some(id)) = enumerator.default_endpoint_id(flow, role) {
                defaults.set_role(role, Some(id));
            }
        }

        let inner = Arc::new(CollectionInner {
            enumerator: enumerator.clone(),
            flow,
            mask,
            items: Mutex::new(items),
            defaults: Mutex::new(defaults),
            events: EventRelay::new(),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let subscription =
            enumerator.register(Arc::downgrade(&inner) as Weak<dyn NotificationSink>);
        *inner.subscription.lock().unwrap() = Some(subscription);

        Ok(Self { inner })
    }

    pub fn flow(&self) -> DataFlow {
        self.inner.flow
    }

    pub fn state_mask(&self) -> DeviceStateMask {
        self.inner.mask
    }

    /// Snapshot of the current members, in discovery order.
    pub fn devices(&self) -> Vec<Arc<AudioDevice>> {
        self.inner.items.lock().unwrap().clone()
    }

    /// Look up a member by identifier.
    pub fn device(&self, device_id: &str) -> Option<Arc<AudioDevice>> {
        self.inner
            .items
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id() == device_id)
            .cloned()
    }

    /// The per-role default identity for this view's direction.
    pub fn default_device_id(&self) -> DefaultDeviceId {
        self.inner.defaults.lock().unwrap().clone()
    }

    /// True iff `device_id` is the default for any role in this direction.
    pub fn is_default(&self, device_id: &str) -> bool {
        self.inner.defaults.lock().unwrap().is_default(device_id)
    }

    /// Subscribe to relayed, collection-consistent events.
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Release every member and the enumerator subscription. Idempotent;
    /// notifications arriving after close are ignored.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for DeviceCollection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl CollectionInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for device in self.items.lock().unwrap().drain(..) {
            device.release();
        }
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            self.enumerator.unregister(subscription);
        }
    }

    fn on_device_added(&self, device_id: &str) {
        if self
            .items
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.id() == device_id)
        {
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

        if snapshot.flow != self.flow || !self.mask.is_exactly(snapshot.state) {
            // Outside this view's filter; dropping the snapshot releases it.
            debug!(device_id, "added device does not match view filter");
            return;
        }

        let device = Arc::new(AudioDevice::from_snapshot(snapshot));
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|d| d.id() == device_id) {
            return;
        }
        items.push(device);
        drop(items);

        self.events.emit(DeviceEvent::DeviceAdded {
            device_id: device_id.to_string(),
        });
    }

    fn on_device_removed(&self, device_id: &str) {
        let removed = {
            let mut items = self.items.lock().unwrap();
            items
                .iter()
                .position(|d| d.id() == device_id)
                .map(|index| items.remove(index))
        };

        if let Some(device) = removed {
            device.release();
            self.events.emit(DeviceEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        }
    }

    fn on_state_changed(&self, device_id: &str) {
        // The entity is refetched rather than trusting the notification
        // payload; the refetched copy decides admission or eviction.
        let refetched = match self.enumerator.device(device_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(err) => {
                warn!(device_id, error = %err, "device refetch failed during state change");
                return;
            }
        };

        // Hardware devices are not expected to change direction; if one
        // does, the notification is ignored entirely.
        if refetched.flow != self.flow {
            return;
        }

        let state = refetched.state;
        let mut emitted = None;
        {
            let mut items = self.items.lock().unwrap();
            let member = items.iter().position(|d| d.id() == device_id);
            match member {
                Some(index) if !self.mask.is_exactly(state) => {
                    let device = items.remove(index);
                    device.release();
                    drop(refetched);
                    emitted = Some(DeviceEvent::StateChanged {
                        device_id: device_id.to_string(),
                        state,
                    });
                }
                None if self.mask.is_exactly(state) => {
                    items.push(Arc::new(AudioDevice::from_snapshot(refetched)));
                    emitted = Some(DeviceEvent::StateChanged {
                        device_id: device_id.to_string(),
                        state,
                    });
                }
                // No membership change: the refetched copy is discarded
                // rather than reloading an unchanged member in place.
                _ => {}
            }
        }

        if let Some(event) = emitted {
            self.events.emit(event);
        }
    }

    fn on_property_changed(&self, device_id: &str, key: &str) {
        let member = self
            .items
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id() == device_id)
            .cloned();

        let Some(device) = member else {
            return;
        };

        match self.enumerator.load_properties(device_id) {
            Ok(properties) => device.store_properties(properties),
            Err(err) => {
                warn!(device_id, error = %err, "property reload failed");
            }
        }

        self.events.emit(DeviceEvent::PropertyChanged {
            device_id: device_id.to_string(),
            key: key.to_string(),
        });
    }

    fn on_default_changed(&self, flow: DataFlow, role: DeviceRole, device_id: Option<&str>) {
        if flow != self.flow {
            return;
        }

        // Updated even when the id is not currently a member; the identity
        // tolerates transient staleness.
        self.defaults
            .lock()
            .unwrap()
            .set_role(role, device_id.map(String::from));

        self.events.emit(DeviceEvent::DefaultChanged {
            flow,
            role,
            device_id: device_id.map(String::from),
        });
    }
}

impl NotificationSink for CollectionInner {
    fn notify(&self, event: &DeviceEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            DeviceEvent::DeviceAdded { device_id } => self.on_device_added(device_id),
            DeviceEvent::DeviceRemoved { device_id } => self.on_device_removed(device_id),
            DeviceEvent::StateChanged { device_id, .. } => self.on_state_changed(device_id),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::testutil::{drain, init_tracing, FakeEnumerator};
    use crate::AudioError;

    fn render_active_fixture() -> (Arc<FakeEnumerator>, DeviceCollection) {
        init_tracing();
        let fake = FakeEnumerator::new();
        fake.add_device("A", DataFlow::Render, DeviceState::Active);
        fake.add_device("B", DataFlow::Render, DeviceState::Disabled);
        fake.add_device("C", DataFlow::Capture, DeviceState::Active);

        let collection = DeviceCollection::new(
            fake.clone(),
            DataFlow::Render,
            DeviceStateMask::ACTIVE,
        )
        .unwrap();
        (fake, collection)
    }

    fn member_ids(collection: &DeviceCollection) -> Vec<String> {
        collection
            .devices()
            .iter()
            .map(|d| d.id().to_string())
            .collect()
    }

    #[test]
    fn wildcard_direction_is_rejected() {
        let fake = FakeEnumerator::new();
        let result = DeviceCollection::new(fake, DataFlow::All, DeviceStateMask::ALL);
        assert!(matches!(result, Err(AudioError::UnsupportedDataFlow)));
    }

    #[test]
    fn admission_eviction_scenario() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();
        assert_eq!(member_ids(&collection), vec!["A"]);

        // B turns active: admitted, one StateChanged.
        fake.set_device_state("B", DeviceState::Active);
        fake.notify(DeviceEvent::StateChanged {
            device_id: "B".to_string(),
            state: DeviceState::Active,
        });
        assert_eq!(member_ids(&collection), vec!["A", "B"]);
        let relayed = drain(&events);
        assert_eq!(relayed.len(), 1);
        assert!(matches!(
            &relayed[0],
            DeviceEvent::StateChanged { device_id, state: DeviceState::Active } if device_id == "B"
        ));

        // A is removed: one DeviceRemoved.
        fake.remove_device("A");
        fake.notify(DeviceEvent::DeviceRemoved {
            device_id: "A".to_string(),
        });
        assert_eq!(member_ids(&collection), vec!["B"]);
        let relayed = drain(&events);
        assert_eq!(relayed.len(), 1);
        assert!(matches!(
            &relayed[0],
            DeviceEvent::DeviceRemoved { device_id } if device_id == "A"
        ));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();
        let before = collection.device("A").unwrap();

        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "A".to_string(),
        });

        let after = collection.device("A").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(member_ids(&collection), vec!["A"]);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn add_outside_filter_releases_the_fetched_copy() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        // C is capture; fetching it for a render view must release the copy.
        let created_before = fake.handles_created("C");
        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "C".to_string(),
        });

        assert_eq!(member_ids(&collection), vec!["A"]);
        assert!(drain(&events).is_empty());
        assert_eq!(fake.handles_created("C"), created_before + 1);
        assert_eq!(fake.handles_released("C"), created_before + 1);
    }

    #[test]
    fn removal_of_unknown_device_is_a_noop() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        fake.notify(DeviceEvent::DeviceRemoved {
            device_id: "no-such-device".to_string(),
        });

        assert_eq!(member_ids(&collection), vec!["A"]);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn eviction_happens_exactly_once() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        fake.set_device_state("A", DeviceState::Unplugged);
        fake.notify(DeviceEvent::StateChanged {
            device_id: "A".to_string(),
            state: DeviceState::Unplugged,
        });
        // Replay of the same notification: A is no longer a member and its
        // state is outside the mask, so nothing further happens.
        fake.notify(DeviceEvent::StateChanged {
            device_id: "A".to_string(),
            state: DeviceState::Unplugged,
        });

        assert!(member_ids(&collection).is_empty());
        assert_eq!(drain(&events).len(), 1);
        assert_eq!(fake.handles_created("A"), fake.handles_released("A"));
    }

    #[test]
    fn direction_change_is_silently_ignored() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        fake.set_device_flow("A", DataFlow::Capture);
        fake.notify(DeviceEvent::StateChanged {
            device_id: "A".to_string(),
            state: DeviceState::Active,
        });

        // A stays a member; the refetched copy with the foreign direction
        // is discarded without any visible change.
        assert_eq!(member_ids(&collection), vec!["A"]);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn final_membership_is_order_independent() {
        let fake = FakeEnumerator::new();
        fake.add_device("A", DataFlow::Render, DeviceState::Active);
        let collection =
            DeviceCollection::new(fake.clone(), DataFlow::Render, DeviceStateMask::ACTIVE)
                .unwrap();

        fake.add_device("B", DataFlow::Render, DeviceState::Active);
        fake.add_device("D", DataFlow::Render, DeviceState::Active);

        // Interleave notifications for independent devices in a scrambled
        // order relative to discovery.
        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "D".to_string(),
        });
        fake.remove_device("A");
        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "B".to_string(),
        });
        fake.notify(DeviceEvent::DeviceRemoved {
            device_id: "A".to_string(),
        });
        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "B".to_string(),
        });

        assert_eq!(member_ids(&collection), vec!["D", "B"]);
    }

    #[test]
    fn property_change_reloads_member_cache() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        fake.set_device_property("A", crate::device::PKEY_DEVICE_FRIENDLY_NAME, "Speakers");
        fake.notify(DeviceEvent::PropertyChanged {
            device_id: "A".to_string(),
            key: crate::device::PKEY_DEVICE_FRIENDLY_NAME.to_string(),
        });

        assert_eq!(
            collection.device("A").unwrap().friendly_name().as_deref(),
            Some("Speakers")
        );
        assert_eq!(drain(&events).len(), 1);

        // Non-members are not reloaded and nothing is relayed.
        fake.notify(DeviceEvent::PropertyChanged {
            device_id: "C".to_string(),
            key: crate::device::PKEY_DEVICE_FRIENDLY_NAME.to_string(),
        });
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn default_identity_tracks_only_matching_direction() {
        let fake = FakeEnumerator::new();
        fake.add_device("R", DataFlow::Render, DeviceState::Active);
        fake.add_device("C", DataFlow::Capture, DeviceState::Active);

        let render =
            DeviceCollection::new(fake.clone(), DataFlow::Render, DeviceStateMask::ACTIVE)
                .unwrap();
        let capture =
            DeviceCollection::new(fake.clone(), DataFlow::Capture, DeviceStateMask::ACTIVE)
                .unwrap();

        fake.notify(DeviceEvent::DefaultChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Multimedia,
            device_id: Some("R".to_string()),
        });

        assert_eq!(
            render.default_device_id().multimedia.as_deref(),
            Some("R")
        );
        assert!(render.is_default("R"));
        assert_eq!(capture.default_device_id().multimedia, None);
        assert!(!capture.is_default("R"));
    }

    #[test]
    fn default_identity_accepts_nonmember_ids() {
        let (fake, collection) = render_active_fixture();

        fake.notify(DeviceEvent::DefaultChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Console,
            device_id: Some("ghost".to_string()),
        });

        assert_eq!(
            collection.default_device_id().console.as_deref(),
            Some("ghost")
        );
    }

    #[test]
    fn initial_defaults_come_from_the_enumerator() {
        let fake = FakeEnumerator::new();
        fake.add_device("A", DataFlow::Render, DeviceState::Active);
        fake.set_default(DataFlow::Render, DeviceRole::Multimedia, "A");
        fake.set_default(DataFlow::Render, DeviceRole::Communications, "A");

        let collection =
            DeviceCollection::new(fake, DataFlow::Render, DeviceStateMask::ACTIVE).unwrap();

        let defaults = collection.default_device_id();
        assert_eq!(defaults.multimedia.as_deref(), Some("A"));
        assert_eq!(defaults.communications.as_deref(), Some("A"));
        assert_eq!(defaults.console, None);
    }

    #[test]
    fn close_is_idempotent_and_stops_the_relay() {
        let (fake, collection) = render_active_fixture();
        let events = collection.subscribe();

        collection.close();
        collection.close();

        assert_eq!(fake.handles_created("A"), fake.handles_released("A"));
        assert_eq!(fake.sink_count(), 0);

        // In-flight or late notifications resolve to no-ops.
        fake.notify(DeviceEvent::DeviceAdded {
            device_id: "A".to_string(),
        });
        assert!(drain(&events).is_empty());
        assert!(collection.devices().is_empty());
    }

    #[test]
    fn dropping_the_collection_releases_members() {
        let fake = FakeEnumerator::new();
        fake.add_device("A", DataFlow::Render, DeviceState::Active);
        {
            let _collection =
                DeviceCollection::new(fake.clone(), DataFlow::Render, DeviceStateMask::ACTIVE)
                    .unwrap();
            assert_eq!(fake.handles_released("A"), 0);
        }
        assert_eq!(fake.handles_created("A"), fake.handles_released("A"));
    }
}
