//! In-memory repository used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use drawbridge_core::{DrawbridgeError, DrawbridgeResult};

use crate::events::Event;

use super::{DeviceRecord, NewService, Repository, ServiceRecord, StoredDeviceCert};

#[derive(Default)]
struct Inner {
    settings: BTreeMap<String, String>,
    services: BTreeMap<u16, ServiceRecord>,
    next_service_id: u16,
    devices: BTreeMap<String, DeviceRecord>,
    events: Vec<Event>,
    fail_event_writes: bool,
}

/// Repository kept entirely in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, for assertions.
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Make subsequent `append_event` calls fail, for sink drop tests.
    pub fn fail_event_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_event_writes = fail;
    }
}

impl Repository for MemoryRepository {
    fn get_setting(&self, key: &str) -> DrawbridgeResult<Option<String>> {
        Ok(self.inner.lock().unwrap().settings.get(key).cloned())
    }

    fn put_setting(&self, key: &str, value: &str) -> DrawbridgeResult<()> {
        self.inner
            .lock()
            .unwrap()
            .settings
            .insert(key.into(), value.into());
        Ok(())
    }

    fn list_services(&self) -> DrawbridgeResult<Vec<ServiceRecord>> {
        Ok(self.inner.lock().unwrap().services.values().cloned().collect())
    }

    fn insert_service(&self, service: &NewService) -> DrawbridgeResult<ServiceRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_service_id += 1;
        let record = ServiceRecord {
            id: inner.next_service_id,
            name: service.name.clone(),
            description: service.description.clone(),
            host: service.host.clone(),
            port: service.port,
        };
        inner.services.insert(record.id, record.clone());
        Ok(record)
    }

    fn update_service(&self, service: &ServiceRecord) -> DrawbridgeResult<()> {
        self.inner
            .lock()
            .unwrap()
            .services
            .insert(service.id, service.clone());
        Ok(())
    }

    fn delete_service(&self, id: u16) -> DrawbridgeResult<()> {
        self.inner.lock().unwrap().services.remove(&id);
        Ok(())
    }

    fn list_device_certs(&self) -> DrawbridgeResult<Vec<StoredDeviceCert>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .devices
            .values()
            .map(|d| StoredDeviceCert {
                certificate_pem: d.certificate_pem.clone(),
                device_id: d.id.clone(),
                revoked: d.revoked,
            })
            .collect())
    }

    fn create_device(&self, device: &DeviceRecord) -> DrawbridgeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.devices.values().any(|d| d.name == device.name) {
            return Err(DrawbridgeError::Store(format!(
                "device name {} already exists",
                device.name
            )));
        }
        inner.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    fn set_device_revoked(&self, device_id: &str, revoked: bool) -> DrawbridgeResult<()> {
        if let Some(device) = self.inner.lock().unwrap().devices.get_mut(device_id) {
            device.revoked = revoked;
        }
        Ok(())
    }

    fn append_event(&self, event: &Event) -> DrawbridgeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_event_writes {
            return Err(DrawbridgeError::Store("event store unavailable".into()));
        }
        inner.events.push(event.clone());
        Ok(())
    }
}
