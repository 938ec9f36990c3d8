//! Persisted default-endpoint policy service.
//!
//! Wraps the native per-process policy object behind an opaque
//! [`PolicyBackend`]. Activation happens once, at construction, and is
//! allowed to fail: an unacquired service answers every operation with
//! `None`/`false` instead of faulting.

use crate::device::{AudioError, DataFlow, DeviceRole};
use std::sync::Mutex;
use tracing::warn;

/// Native policy object operations.
///
/// "No persisted value" is `Ok(None)`, not an error; `Err` is reserved for
/// genuine subsystem failures.
pub trait PolicyBackend: Send + Sync {
    fn persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Result<Option<String>, AudioError>;

    fn set_persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<&str>,
    ) -> Result<(), AudioError>;

    fn clear_all_persisted(&self) -> Result<(), AudioError>;
}

/// Process-level persisted default-endpoint overrides.
pub struct PolicyConfig {
    backend: Mutex<Option<Box<dyn PolicyBackend>>>,
}

impl PolicyConfig {
    /// Activate the native policy object through a one-shot factory.
    ///
    /// Activation failure is not fatal: the service stays unacquired and
    /// every operation fails gracefully.
    pub fn new<F>(factory: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn PolicyBackend>, AudioError>,
    {
        let backend = match factory() {
            Ok(backend) => Some(backend),
            Err(err) => {
                warn!(error = %err, "policy backend activation failed; persisted-default operations disabled");
                None
            }
        };
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// A service with no backend; every operation returns `None`/`false`.
    pub fn disabled() -> Self {
        Self {
            backend: Mutex::new(None),
        }
    }

    /// Whether the native policy object was acquired and not yet released.
    pub fn is_acquired(&self) -> bool {
        self.backend.lock().unwrap().is_some()
    }

    /// The persisted default endpoint for a process, if one is stored.
    pub fn persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
    ) -> Option<String> {
        let backend = self.backend.lock().unwrap();
        let backend = backend.as_ref()?;
        match backend.persisted_default(process_id, flow, role) {
            Ok(device_id) => device_id,
            Err(err) => {
                warn!(process_id, error = %err, "persisted-default query failed");
                None
            }
        }
    }

    /// Persist a default endpoint for a process. `None` clears the entry.
    /// Returns `false` when the service is unacquired or the call failed.
    pub fn set_persisted_default(
        &self,
        process_id: u32,
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<&str>,
    ) -> bool {
        let backend = self.backend.lock().unwrap();
        let Some(backend) = backend.as_ref() else {
            return false;
        };
        match backend.set_persisted_default(process_id, flow, role, device_id) {
            Ok(()) => true,
            Err(err) => {
                warn!(process_id, error = %err, "persisting default endpoint failed");
                false
            }
        }
    }

    /// Remove every persisted per-process default. Returns `false` when the
    /// service is unacquired or the call failed.
    pub fn clear_all_persisted(&self) -> bool {
        let backend = self.backend.lock().unwrap();
        let Some(backend) = backend.as_ref() else {
            return false;
        };
        match backend.clear_all_persisted() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "clearing persisted defaults failed");
                false
            }
        }
    }

    /// Release the native policy object. Idempotent.
    pub fn close(&self) {
        drop(self.backend.lock().unwrap().take());
    }
}

impl std::fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("acquired", &self.is_acquired())
            .finish()
    }
}
