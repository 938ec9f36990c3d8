//! Windows Core Audio backend.
//!
//! Implements [`crate::enumerator::DeviceEnumerator`] over the MMDevice API
//! and [`crate::policy::PolicyBackend`] over the undocumented audio policy
//! configuration object. Raw IMMNotificationClient callbacks are fanned out
//! to every registered sink.

use crate::device::{
    AudioError, DataFlow, DeviceRole, DeviceState, DeviceStateMask, PropertyMap,
    PKEY_DEVICE_FRIENDLY_NAME,
};
use crate::enumerator::{
    DeviceEnumerator as EnumeratorService, DeviceSnapshot, NotificationSink, SubscriptionId,
};
use crate::policy::PolicyBackend;
use crate::session::{next_subscription_id, SessionManager};
use std::ffi::c_void;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;
use windows::core::{implement, interface, IUnknown, Interface, HRESULT, HSTRING, PCWSTR};
use windows::Win32::Devices::Properties::DEVPKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::{
    eAll, eCapture, eCommunications, eConsole, eMultimedia, eRender, EDataFlow, ERole,
    IMMDevice, IMMDeviceEnumerator, IMMEndpoint, IMMNotificationClient,
    IMMNotificationClient_Impl, MMDeviceEnumerator, DEVICE_STATE,
};
use windows::Win32::System::Com::{CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED, STGM};
use windows::Win32::System::WinRT::RoGetActivationFactory;
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

fn win_err(err: windows::core::Error) -> AudioError {
    AudioError::Native(err.into())
}

/// COM initialization guard that uninitializes COM on drop.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Initialize COM for the current thread. Multithreaded apartment:
    /// notification callbacks arrive on MMDevice worker threads.
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(win_err)?;
        }
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

fn to_edataflow(flow: DataFlow) -> EDataFlow {
    match flow {
        DataFlow::Render => eRender,
        DataFlow::Capture => eCapture,
        DataFlow::All => eAll,
    }
}

fn from_edataflow(flow: EDataFlow) -> DataFlow {
    if flow == eRender {
        DataFlow::Render
    } else if flow == eCapture {
        DataFlow::Capture
    } else {
        DataFlow::All
    }
}

fn to_erole(role: DeviceRole) -> ERole {
    match role {
        DeviceRole::Console => eConsole,
        DeviceRole::Multimedia => eMultimedia,
        DeviceRole::Communications => eCommunications,
    }
}

fn from_erole(role: ERole) -> DeviceRole {
    if role == eConsole {
        DeviceRole::Console
    } else if role == eCommunications {
        DeviceRole::Communications
    } else {
        DeviceRole::Multimedia
    }
}

fn from_device_state(state: DEVICE_STATE) -> DeviceState {
    match state.0 {
        1 => DeviceState::Active,
        2 => DeviceState::Disabled,
        4 => DeviceState::NotPresent,
        8 => DeviceState::Unplugged,
        _ => DeviceState::NotPresent,
    }
}

fn property_key_name(key: &PROPERTYKEY) -> String {
    if key.fmtid == DEVPKEY_Device_FriendlyName.fmtid && key.pid == DEVPKEY_Device_FriendlyName.pid
    {
        PKEY_DEVICE_FRIENDLY_NAME.to_string()
    } else {
        format!("{:?}/{}", key.fmtid, key.pid)
    }
}

/// Registered sinks, shared between the enumerator wrapper and the COM
/// notification client.
#[derive(Default)]
struct SinkTable {
    entries: Mutex<Vec<(SubscriptionId, Weak<dyn NotificationSink>)>>,
}

impl SinkTable {
    fn dispatch(&self, event: crate::device::DeviceEvent) {
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|(_, weak)| weak.strong_count() > 0);
            entries
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for sink in sinks {
            sink.notify(&event);
        }
    }
}

/// Notification client that fans raw callbacks out to the sink table.
#[implement(IMMNotificationClient)]
struct NotificationClient {
    sinks: Arc<SinkTable>,
}

impl IMMNotificationClient_Impl for NotificationClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                self.sinks.dispatch(crate::device::DeviceEvent::StateChanged {
                    device_id: id,
                    state: from_device_state(dwnewstate),
                });
            }
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                self.sinks
                    .dispatch(crate::device::DeviceEvent::DeviceAdded { device_id: id });
            }
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                self.sinks
                    .dispatch(crate::device::DeviceEvent::DeviceRemoved { device_id: id });
            }
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        unsafe {
            let device_id = if pwstrdefaultdeviceid.is_null() {
                None
            } else {
                pwstrdefaultdeviceid.to_string().ok()
            };

            self.sinks.dispatch(crate::device::DeviceEvent::DefaultChanged {
                flow: from_edataflow(flow),
                role: from_erole(role),
                device_id,
            });
        }
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                self.sinks
                    .dispatch(crate::device::DeviceEvent::PropertyChanged {
                        device_id: id,
                        key: property_key_name(key),
                    });
            }
        }
        Ok(())
    }
}

/// Keeps the endpoint's COM pointer alive until the owning device record is
/// released.
struct EndpointHandle(#[allow(dead_code)] IMMDevice);

// SAFETY: MMDevice objects are free-threaded; the wrapper only moves the
// pointer between threads and releases it on drop
unsafe impl Send for EndpointHandle {}

/// Device enumeration service over the Windows MMDevice API.
///
/// Note: COM must be initialized (see [`ComGuard`]) before construction.
pub struct WasapiEnumerator {
    enumerator: IMMDeviceEnumerator,
    sinks: Arc<SinkTable>,
    callback: IMMNotificationClient,
}

// SAFETY: the MMDevice enumerator and the registered notification callback
// are free-threaded COM objects; all mutable state sits behind the sink
// table's mutex
unsafe impl Send for WasapiEnumerator {}
unsafe impl Sync for WasapiEnumerator {}

impl WasapiEnumerator {
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL).map_err(win_err)?;

            let sinks = Arc::new(SinkTable::default());
            let callback: IMMNotificationClient = NotificationClient {
                sinks: sinks.clone(),
            }
            .into();
            enumerator
                .RegisterEndpointNotificationCallback(&callback)
                .map_err(win_err)?;

            Ok(Self {
                enumerator,
                sinks,
                callback,
            })
        }
    }

    fn snapshot(&self, device: &IMMDevice) -> Result<DeviceSnapshot, AudioError> {
        unsafe {
            let id = device.GetId().map_err(win_err)?;
            let id = id
                .to_string()
                .map_err(|e| AudioError::Native(anyhow::anyhow!("device id: {e}")))?;

            let endpoint: IMMEndpoint = device.cast().map_err(win_err)?;
            let flow = from_edataflow(endpoint.GetDataFlow().map_err(win_err)?);
            let state = from_device_state(device.GetState().map_err(win_err)?);
            let properties = self.read_properties(device);

            Ok(DeviceSnapshot {
                id,
                flow,
                state,
                properties,
                // The COM pointer is the native handle; dropping it is the
                // release.
                handle: Some(Box::new(EndpointHandle(device.clone()))),
            })
        }
    }

    fn read_properties(&self, device: &IMMDevice) -> PropertyMap {
        let mut properties = PropertyMap::new();
        unsafe {
            let Ok(store) = device.OpenPropertyStore(STGM(0)) else {
                return properties;
            };
            if let Some(name) = read_friendly_name(&store) {
                properties.insert(PKEY_DEVICE_FRIENDLY_NAME.to_string(), name);
            }
        }
        properties
    }
}

fn read_friendly_name(store: &IPropertyStore) -> Option<String> {
    unsafe {
        // Convert DEVPROPKEY to PROPERTYKEY
        let key = PROPERTYKEY {
            fmtid: DEVPKEY_Device_FriendlyName.fmtid,
            pid: DEVPKEY_Device_FriendlyName.pid,
        };

        let value = store.GetValue(&key).ok()?;
        let name = value.to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

impl EnumeratorService for WasapiEnumerator {
    fn enumerate(
        &self,
        flow: DataFlow,
        mask: DeviceStateMask,
    ) -> Result<Vec<DeviceSnapshot>, AudioError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(to_edataflow(flow), DEVICE_STATE(mask.0))
                .map_err(win_err)?;
            let count = collection.GetCount().map_err(win_err)?;

            let mut snapshots = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = collection.Item(i).map_err(win_err)?;
                match self.snapshot(&device) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(err) => warn!(index = i, error = %err, "skipping unreadable endpoint"),
                }
            }
            Ok(snapshots)
        }
    }

    fn device(&self, device_id: &str) -> Result<Option<DeviceSnapshot>, AudioError> {
        unsafe {
            let id_wide: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
            let device = match self.enumerator.GetDevice(PCWSTR::from_raw(id_wide.as_ptr())) {
                Ok(device) => device,
                Err(_) => return Ok(None),
            };
            self.snapshot(&device).map(Some)
        }
    }

    fn default_endpoint(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<DeviceSnapshot>, AudioError> {
        unsafe {
            let device = match self
                .enumerator
                .GetDefaultAudioEndpoint(to_edataflow(flow), to_erole(role))
            {
                Ok(device) => device,
                Err(_) => return Ok(None),
            };
            self.snapshot(&device).map(Some)
        }
    }

    fn default_endpoint_id(
        &self,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError> {
        unsafe {
            let device = match self
                .enumerator
                .GetDefaultAudioEndpoint(to_edataflow(flow), to_erole(role))
            {
                Ok(device) => device,
                Err(_) => return Ok(None),
            };
            let id = device.GetId().map_err(win_err)?;
            Ok(Some(id.to_string().map_err(|e| {
                AudioError::Native(anyhow::anyhow!("device id: {e}"))
            })?))
        }
    }

    fn set_default_endpoint(&self, device_id: &str, role: DeviceRole) -> Result<(), AudioError> {
        unsafe {
            let policy: IPolicyConfig =
                CoCreateInstance(&CLSID_POLICY_CONFIG_CLIENT, None, CLSCTX_ALL).map_err(win_err)?;
            let id_wide: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
            policy
                .SetDefaultEndpoint(PCWSTR::from_raw(id_wide.as_ptr()), to_erole(role).0 as u32)
                .ok()
                .map_err(win_err)?;
            Ok(())
        }
    }

    fn load_properties(&self, device_id: &str) -> Result<PropertyMap, AudioError> {
        unsafe {
            let id_wide: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
            let device = self
                .enumerator
                .GetDevice(PCWSTR::from_raw(id_wide.as_ptr()))
                .map_err(|_| AudioError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?;
            Ok(self.read_properties(&device))
        }
    }

    fn session_manager(
        &self,
        _device_id: &str,
    ) -> Result<Option<Arc<SessionManager>>, AudioError> {
        // Note: IAudioSessionManager2 activation and IAudioSessionEvents
        // registration are not wired yet; sessions are unavailable through
        // this backend.
        Ok(None)
    }

    fn register(&self, sink: Weak<dyn NotificationSink>) -> SubscriptionId {
        let id = next_subscription_id();
        self.sinks.entries.lock().unwrap().push((id, sink));
        id
    }

    fn unregister(&self, subscription: SubscriptionId) {
        self.sinks
            .entries
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != subscription);
    }
}

impl Drop for WasapiEnumerator {
    fn drop(&mut self) {
        unsafe {
            let _ = self
                .enumerator
                .UnregisterEndpointNotificationCallback(&self.callback);
        }
    }
}

// PolicyConfigClient CLSID
const CLSID_POLICY_CONFIG_CLIENT: windows::core::GUID =
    windows::core::GUID::from_u128(0x870af99c_171d_4f9e_af0d_e63df40c2bc9);

/// IPolicyConfig COM interface (undocumented but stable)
/// Used to set the default audio device
#[interface("F8679F50-850A-41CF-9C72-430F290290C8")]
unsafe trait IPolicyConfig: IUnknown {
    // Reserved methods to maintain vtable order
    fn reserved1(&self) -> HRESULT;
    fn reserved2(&self) -> HRESULT;
    fn reserved3(&self) -> HRESULT;
    fn reserved4(&self) -> HRESULT;
    fn reserved5(&self) -> HRESULT;
    fn reserved6(&self) -> HRESULT;
    fn reserved7(&self) -> HRESULT;
    fn reserved8(&self) -> HRESULT;
    fn reserved9(&self) -> HRESULT;
    fn reserved10(&self) -> HRESULT;

    fn SetDefaultEndpoint(&self, device_id: PCWSTR, role: u32) -> HRESULT;
}

/// Runtime class hosting the persisted default-endpoint interface.
const AUDIO_POLICY_CONFIG_CLASS: &str = "Windows.Media.Internal.AudioPolicyConfig";

/// Persisted per-process default-endpoint interface (undocumented). The
/// reserved block mirrors the runtime class vtable ahead of the persisted
/// methods.
#[interface("ab3d4648-e242-459f-b02f-541c70306324")]
unsafe trait IAudioPolicyConfigFactory: IUnknown {
    fn reserved1(&self) -> HRESULT;
    fn reserved2(&self) -> HRESULT;
    fn reserved3(&self) -> HRESULT;
    fn reserved4(&self) -> HRESULT;
    fn reserved5(&self) -> HRESULT;
    fn reserved6(&self) -> HRESULT;
    fn reserved7(&self) -> HRESULT;
    fn reserved8(&self) -> HRESULT;
    fn reserved9(&self) -> HRESULT;
    fn reserved10(&self) -> HRESULT;
    fn reserved11(&self) -> HRESULT;
    fn reserved12(&self) -> HRESULT;
    fn reserved13(&self) -> HRESULT;
    fn reserved14(&self) -> HRESULT;
    fn reserved15(&self) -> HRESULT;
    fn reserved16(&self) -> HRESULT;
    fn reserved17(&self) -> HRESULT;
    fn reserved18(&self) -> HRESULT;
    fn reserved19(&self) -> HRESULT;
    fn reserved20(&self) -> HRESULT;
    fn reserved21(&self) -> HRESULT;
    fn reserved22(&self) -> HRESULT;

    // HSTRING in-params are borrowed by the callee and freed by us; the
    // out-param hands us ownership of the written handle.
    fn SetPersistedDefaultAudioEndpoint(
        &self,
        process_id: u32,
        flow: EDataFlow,
        role: ERole,
        device_id: *mut c_void,
    ) -> HRESULT;
    fn GetPersistedDefaultAudioEndpoint(
        &self,
        process_id: u32,
        flow: EDataFlow,
        role: ERole,
        device_id: *mut HSTRING,
    ) -> HRESULT;
    fn ClearAllPersistedApplicationDefaultEndpoints(&self) -> HRESULT;
}

/// Policy backend over the activated audio policy configuration object.
pub struct WasapiPolicyBackend {
    config: IAudioPolicyConfigFactory,
}

// SAFETY: the activated policy object is a WinRT agile object; calls from any
// thread are valid
unsafe impl Send for WasapiPolicyBackend {}
unsafe impl Sync for WasapiPolicyBackend {}

/// One-shot activation for [`crate::policy::PolicyConfig::new`].
pub fn activate_policy() -> Result<Box<dyn PolicyBackend>, AudioError> {
    unsafe {
        let class = HSTRING::from(AUDIO_POLICY_CONFIG_CLASS);
        let config: IAudioPolicyConfigFactory =
            RoGetActivationFactory(&class).map_err(win_err)?;
        Ok(Box::new(WasapiPolicyBackend { config }))
    }
}

impl PolicyBackend for WasapiPolicyBackend {
    fn persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError> {
        unsafe {
            let mut device_id = HSTRING::default();
            let hr = self.config.GetPersistedDefaultAudioEndpoint(
                process_id,
                to_edataflow(flow),
                to_erole(role),
                &mut device_id,
            );
            if hr.is_err() || device_id.is_empty() {
                // No persisted value for this process/role.
                return Ok(None);
            }
            Ok(Some(device_id.to_string()))
        }
    }

    fn set_persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<&str>,
    ) -> Result<(), AudioError> {
        unsafe {
            let hstring = HSTRING::from(device_id.unwrap_or_default());
            let raw: *mut c_void = std::mem::transmute_copy(&hstring);
            let hr = self.config.SetPersistedDefaultAudioEndpoint(
                process_id,
                to_edataflow(flow),
                to_erole(role),
                raw,
            );
            drop(hstring);
            hr.ok().map_err(win_err)
        }
    }

    fn clear_all_persisted(&self) -> Result<(), AudioError> {
        unsafe {
            self.config
                .ClearAllPersistedApplicationDefaultEndpoints()
                .ok()
                .map_err(win_err)
        }
    }
}
