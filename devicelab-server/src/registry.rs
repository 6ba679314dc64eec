//! Device registry
//!
//! In-memory keyed store of device records with stable synthetic ids. Runs
//! discovery cycles that reconcile the observed device sets against the
//! registry, owns the per-device log-tail lifecycle, and is the sole
//! authority over device status transitions.

use crate::supervisor::DriverSupervisor;
use chrono::Utc;
use devicelab_common::{
    Device, DeviceAdapter, DeviceCapabilities, DeviceKind, DeviceStatus, Event, EventSink,
    LabError, LogTailHandle, Orientation, Platform, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Keyed store of device records plus the discovery machinery
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
    adapters: Vec<Arc<dyn DeviceAdapter>>,
    supervisor: Arc<DriverSupervisor>,
    sink: Arc<dyn EventSink>,
    tails: Mutex<HashMap<String, LogTailHandle>>,
}

impl DeviceRegistry {
    pub fn new(
        adapters: Vec<Arc<dyn DeviceAdapter>>,
        supervisor: Arc<DriverSupervisor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            adapters,
            supervisor,
            sink,
            tails: Mutex::new(HashMap::new()),
        }
    }

    /// Adapter serving the given platform
    pub fn adapter_for(&self, platform: Platform) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.platform() == platform)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut list: Vec<Device> = devices.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn get(&self, device_id: &str) -> Result<Device> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| LabError::not_found("device", device_id))
    }

    pub async fn count_by_status(&self) -> HashMap<DeviceStatus, usize> {
        let devices = self.devices.read().await;
        let mut counts = HashMap::new();
        for device in devices.values() {
            *counts.entry(device.status).or_insert(0) += 1;
        }
        counts
    }

    /// Run one discovery cycle and return the post-cycle device list.
    ///
    /// Both adapters are asked in parallel; a failing sub-source logs and
    /// leaves its platform's records untouched for this cycle.
    pub async fn discovery_cycle(&self) -> Vec<Device> {
        let enumerations = futures::future::join_all(
            self.adapters
                .iter()
                .map(|adapter| async move { (adapter.platform(), adapter.enumerate().await) }),
        )
        .await;

        let mut observed: Vec<(Platform, String, DeviceKind)> = Vec::new();
        let mut healthy_platforms: HashSet<Platform> = HashSet::new();
        for (platform, result) in enumerations {
            match result {
                Ok(devices) => {
                    healthy_platforms.insert(platform);
                    for device in devices {
                        observed.push((platform, device.serial, device.kind));
                    }
                }
                Err(e) => {
                    warn!("Discovery failed for {}: {}", platform, e);
                }
            }
        }

        let observed_serials: HashSet<String> =
            observed.iter().map(|(_, serial, _)| serial.clone()).collect();

        // refresh records for observed devices, collect unknown serials
        let mut new_devices: Vec<(Platform, String, DeviceKind)> = Vec::new();
        {
            let mut devices = self.devices.write().await;
            let known: HashMap<String, String> = devices
                .values()
                .map(|d| (d.serial.clone(), d.id.clone()))
                .collect();

            for (platform, serial, kind) in &observed {
                match known.get(serial) {
                    Some(id) => {
                        if let Some(device) = devices.get_mut(id) {
                            device.last_seen = Utc::now();
                            // reappearing devices come back online; reserved
                            // and in-use statuses are never clobbered
                            if matches!(
                                device.status,
                                DeviceStatus::Offline | DeviceStatus::Unauthorized
                            ) {
                                device.status = DeviceStatus::Online;
                            }
                        }
                    }
                    None => new_devices.push((*platform, serial.clone(), *kind)),
                }
            }
        }

        // enrich new devices outside the registry lock, insert once complete
        for (platform, serial, kind) in new_devices {
            if let Err(e) = self.admit_device(platform, &serial, kind).await {
                warn!("Skipping {} this cycle: {}", serial, e);
            }
        }

        // devices that vanished from the observed set go offline
        let disappeared: Vec<Device> = {
            let devices = self.devices.read().await;
            devices
                .values()
                .filter(|d| {
                    d.status != DeviceStatus::Offline
                        && !observed_serials.contains(&d.serial)
                        && healthy_platforms.contains(&d.platform)
                })
                .cloned()
                .collect()
        };
        for device in disappeared {
            self.mark_disappeared(&device).await;
        }

        let list = self.list().await;
        self.sink.publish(Event::device_list(list.clone())).await;
        list
    }

    /// Query, construct, and insert a newly observed device, then start its
    /// log tail when the platform supports one
    async fn admit_device(&self, platform: Platform, serial: &str, kind: DeviceKind) -> Result<()> {
        let adapter = self
            .adapter_for(platform)
            .ok_or_else(|| LabError::server(format!("no adapter for {}", platform)))?;

        let facts = adapter.facts(serial).await?;
        let device = Device {
            id: uuid::Uuid::new_v4().to_string(),
            serial: serial.to_string(),
            platform,
            kind: if platform == Platform::Ios { facts.kind } else { kind },
            name: facts.name,
            model: facts.model,
            manufacturer: facts.manufacturer,
            os_version: facts.os_version,
            api_level: facts.api_level,
            resolution: facts.resolution,
            orientation: facts.orientation,
            capabilities: facts.capabilities,
            properties: facts.properties,
            status: DeviceStatus::Online,
            battery: facts.battery,
            reserved_by: None,
            reserved_at: None,
            connected_at: Utc::now(),
            last_seen: Utc::now(),
        };
        let device_id = device.id.clone();
        info!("Discovered {} device {} ({})", platform, device.name, serial);

        {
            let mut devices = self.devices.write().await;
            devices.insert(device_id.clone(), device);
        }

        self.start_log_tail(&adapter, serial, &device_id).await;
        Ok(())
    }

    async fn start_log_tail(
        &self,
        adapter: &Arc<dyn DeviceAdapter>,
        serial: &str,
        device_id: &str,
    ) {
        // log tailing is an Android-only capability; other platforms decline
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink_fn: devicelab_common::LogSink = Box::new(move |entry| {
            let _ = tx.send(entry);
        });
        match adapter.tail_logs(serial, device_id, sink_fn).await {
            Ok(handle) => {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    while let Some(entry) = rx.recv().await {
                        sink.publish(Event::device_log(entry)).await;
                    }
                });
                self.tails.lock().await.insert(device_id.to_string(), handle);
            }
            Err(LabError::Unsupported(_)) => {}
            Err(e) => warn!("Could not start log tail for {}: {}", serial, e),
        }
    }

    async fn stop_log_tail(&self, device_id: &str) {
        if let Some(handle) = self.tails.lock().await.remove(device_id) {
            handle.stop();
            debug!("Stopped log tail for {}", device_id);
        }
    }

    async fn mark_disappeared(&self, device: &Device) {
        info!("Device {} ({}) disappeared", device.name, device.serial);
        self.stop_log_tail(&device.id).await;
        self.supervisor.stop(&device.id).await;
        if let Some(adapter) = self.adapter_for(device.platform) {
            adapter.invalidate(&device.serial);
        }

        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(&device.id) {
            record.status = DeviceStatus::Offline;
            record.last_seen = Utc::now();
        }
    }

    /// Stop every log tail (shutdown path)
    pub async fn stop_all_tails(&self) {
        let mut tails = self.tails.lock().await;
        for (device_id, handle) in tails.drain() {
            handle.stop();
            debug!("Stopped log tail for {}", device_id);
        }
    }

    /// Whether the transition is in the legal status machine
    fn transition_allowed(from: DeviceStatus, to: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (from, to),
            (Online, Reserved)
                | (Reserved, InUse)
                | (InUse, Reserved)
                | (InUse, Online)
                | (Reserved, Online)
                | (Offline, Online)
                | (Unauthorized, Online)
                | (_, Offline)
        )
    }

    async fn mutate_status<F>(&self, device_id: &str, to: DeviceStatus, apply: F) -> Result<Device>
    where
        F: FnOnce(&mut Device),
    {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| LabError::not_found("device", device_id))?;
        if device.status != to && !Self::transition_allowed(device.status, to) {
            return Err(LabError::invalid_state(format!(
                "transition {} -> {} is not allowed for device {}",
                device.status, to, device_id
            )));
        }
        device.status = to;
        apply(device);
        Ok(device.clone())
    }

    /// Grant a reservation hold: requires the device to be online
    pub async fn mark_reserved(&self, device_id: &str, user_id: &str) -> Result<Device> {
        {
            let devices = self.devices.read().await;
            let device = devices
                .get(device_id)
                .ok_or_else(|| LabError::not_found("device", device_id))?;
            if !device.is_reservable() {
                return Err(LabError::invalid_state(format!(
                    "device not available: status is {}",
                    device.status
                )));
            }
        }
        let user = user_id.to_string();
        self.mutate_status(device_id, DeviceStatus::Reserved, move |device| {
            device.reserved_by = Some(user);
            device.reserved_at = Some(Utc::now());
        })
        .await
    }

    /// Release a hold: unconditionally returns the device to online
    pub async fn mark_released(&self, device_id: &str) -> Result<Device> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| LabError::not_found("device", device_id))?;
        device.status = DeviceStatus::Online;
        device.reserved_by = None;
        device.reserved_at = None;
        Ok(device.clone())
    }

    /// Session start: only a reserved device moves to in-use
    pub async fn mark_in_use(&self, device_id: &str) -> Result<Device> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| LabError::not_found("device", device_id))?;
        // the transition table admits in-use only from reserved
        if !Self::transition_allowed(device.status, DeviceStatus::InUse) {
            return Err(LabError::invalid_state(format!(
                "cannot start a session while device is {}",
                device.status
            )));
        }
        device.status = DeviceStatus::InUse;
        Ok(device.clone())
    }

    /// Session end: back to reserved when a hold remains, else online.
    /// `reservation_active` reflects whether an active reservation survives
    /// the session.
    pub async fn mark_session_ended(
        &self,
        device_id: &str,
        reservation_active: bool,
    ) -> Result<Device> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| LabError::not_found("device", device_id))?;
        if device.status == DeviceStatus::Offline {
            // device vanished mid-session; it stays offline and the hold clears
            device.reserved_by = None;
            device.reserved_at = None;
            return Ok(device.clone());
        }
        if reservation_active && device.reserved_by.is_some() {
            device.status = DeviceStatus::Reserved;
        } else {
            device.status = DeviceStatus::Online;
            device.reserved_by = None;
            device.reserved_at = None;
        }
        Ok(device.clone())
    }

    /// Seed synthetic offline demo records; never entangled with discovery
    pub async fn seed_offline_devices(&self) {
        let seeds = [
            ("Pixel 6 (lab shelf)", "Pixel 6", "Google", Platform::Android, "13"),
            ("Galaxy S21 (lab shelf)", "SM-G991B", "Samsung", Platform::Android, "12"),
            ("iPhone 12 (lab shelf)", "iPhone13,2", "Apple", Platform::Ios, "16.4"),
        ];
        let mut devices = self.devices.write().await;
        for (name, model, manufacturer, platform, os_version) in seeds {
            let device = Device {
                id: uuid::Uuid::new_v4().to_string(),
                serial: format!("demo-{}", uuid::Uuid::new_v4().simple()),
                platform,
                kind: DeviceKind::Physical,
                name: name.to_string(),
                model: model.to_string(),
                manufacturer: manufacturer.to_string(),
                os_version: os_version.to_string(),
                api_level: None,
                resolution: None,
                orientation: Orientation::Portrait,
                capabilities: DeviceCapabilities::default(),
                properties: HashMap::new(),
                status: DeviceStatus::Offline,
                battery: 0,
                reserved_by: None,
                reserved_at: None,
                connected_at: Utc::now(),
                last_seen: Utc::now(),
            };
            devices.insert(device.id.clone(), device);
        }
        info!("Seeded {} offline demo devices", seeds.len());
    }

    /// Insert a fully formed record (test support and demo seeding)
    pub async fn insert(&self, device: Device) {
        self.devices.write().await.insert(device.id.clone(), device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;
    use devicelab_common::{DriverConfig, NullSink};

    fn registry_with(adapter: Arc<MockAdapter>) -> DeviceRegistry {
        let supervisor = Arc::new(DriverSupervisor::new(
            DriverConfig::default(),
            Arc::new(NullSink),
        ));
        DeviceRegistry::new(vec![adapter], supervisor, Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_discovery_creates_and_enriches() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1", "serial-2"]);
        let registry = registry_with(adapter);

        let list = registry.discovery_cycle().await;
        assert_eq!(list.len(), 2);
        let device = &list[0];
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.battery, 85);
        assert!(device.name.starts_with("Mock"));
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);

        let first = registry.discovery_cycle().await;
        let second = registry.discovery_cycle().await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].status, second[0].status);
        assert!(second[0].last_seen >= first[0].last_seen);
    }

    #[tokio::test]
    async fn test_discovery_churn() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1", "serial-2"]);
        let registry = registry_with(adapter.clone());

        registry.discovery_cycle().await;

        adapter.set_serials(&["serial-1"]);
        let list = registry.discovery_cycle().await;
        assert_eq!(list.len(), 2, "offline devices are not removed");
        let gone = list.iter().find(|d| d.serial == "serial-2").unwrap();
        assert_eq!(gone.status, DeviceStatus::Offline);
        let kept = list.iter().find(|d| d.serial == "serial-1").unwrap();
        assert_eq!(kept.status, DeviceStatus::Online);

        adapter.set_serials(&["serial-1", "serial-2"]);
        let list = registry.discovery_cycle().await;
        let back = list.iter().find(|d| d.serial == "serial-2").unwrap();
        assert_eq!(back.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_discovery_failure_preserves_view() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter.clone());
        registry.discovery_cycle().await;

        adapter.set_fail_enumerate(true);
        let list = registry.discovery_cycle().await;
        assert_eq!(list.len(), 1);
        assert_eq!(
            list[0].status,
            DeviceStatus::Online,
            "a failed enumeration must not offline its platform's devices"
        );
    }

    #[tokio::test]
    async fn test_reserved_status_survives_discovery() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let list = registry.discovery_cycle().await;
        let id = list[0].id.clone();

        registry.mark_reserved(&id, "alice").await.unwrap();
        let list = registry.discovery_cycle().await;
        assert_eq!(list[0].status, DeviceStatus::Reserved);
        assert_eq!(list[0].reserved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_reserve_requires_online() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter.clone());
        let id = registry.discovery_cycle().await[0].id.clone();

        adapter.set_serials(&[]);
        registry.discovery_cycle().await;

        let err = registry.mark_reserved(&id, "alice").await.unwrap_err();
        assert!(matches!(err, LabError::InvalidState(_)));
        assert!(err.to_string().contains("offline"));

        // failed reserve does not mutate the record
        let device = registry.get(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(device.reserved_by.is_none());
    }

    #[tokio::test]
    async fn test_reserve_release_round_trip() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let id = registry.discovery_cycle().await[0].id.clone();

        let reserved = registry.mark_reserved(&id, "alice").await.unwrap();
        assert_eq!(reserved.status, DeviceStatus::Reserved);
        assert_eq!(reserved.reserved_by.as_deref(), Some("alice"));

        let released = registry.mark_released(&id).await.unwrap();
        assert_eq!(released.status, DeviceStatus::Online);
        assert!(released.reserved_by.is_none());
        assert!(released.reserved_at.is_none());
    }

    #[tokio::test]
    async fn test_double_reserve_rejected() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let id = registry.discovery_cycle().await[0].id.clone();

        registry.mark_reserved(&id, "alice").await.unwrap();
        let err = registry.mark_reserved(&id, "bob").await.unwrap_err();
        assert!(matches!(err, LabError::InvalidState(_)));
        assert!(err.to_string().contains("reserved"));
    }

    #[tokio::test]
    async fn test_session_status_cascade() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let id = registry.discovery_cycle().await[0].id.clone();

        registry.mark_reserved(&id, "alice").await.unwrap();
        let in_use = registry.mark_in_use(&id).await.unwrap();
        assert_eq!(in_use.status, DeviceStatus::InUse);

        // reservation still holds: back to reserved
        let device = registry.mark_session_ended(&id, true).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Reserved);

        let in_use = registry.mark_in_use(&id).await.unwrap();
        assert_eq!(in_use.status, DeviceStatus::InUse);

        // no reservation: straight to online with the hold cleared
        let device = registry.mark_session_ended(&id, false).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(device.reserved_by.is_none());
    }

    #[tokio::test]
    async fn test_reserved_by_invariant() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let id = registry.discovery_cycle().await[0].id.clone();

        // reservedBy is non-empty iff status is reserved or in-use
        let device = registry.get(&id).await.unwrap();
        assert!(device.reserved_by.is_none());

        let device = registry.mark_reserved(&id, "alice").await.unwrap();
        assert!(device.reserved_by.is_some());

        let device = registry.mark_in_use(&id).await.unwrap();
        assert!(device.reserved_by.is_some());

        let device = registry.mark_released(&id).await.unwrap();
        assert!(device.reserved_by.is_none());
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let adapter = MockAdapter::new(Platform::Android, &["serial-1"]);
        let registry = registry_with(adapter);
        let id = registry.discovery_cycle().await[0].id.clone();

        // in-use is only reachable from reserved
        let err = registry.mark_in_use(&id).await.unwrap_err();
        assert!(matches!(err, LabError::InvalidState(_)));
        assert!(err.to_string().contains("online"));

        registry.mark_reserved(&id, "alice").await.unwrap();
        registry.mark_in_use(&id).await.unwrap();

        // and neither reserve nor a second session start is legal from in-use
        assert!(registry.mark_reserved(&id, "bob").await.is_err());
        assert!(registry.mark_in_use(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_seed_offline_devices() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        let registry = registry_with(adapter);
        registry.seed_offline_devices().await;
        let list = registry.list().await;
        assert_eq!(list.len(), 3);
        assert!(list.iter().all(|d| d.status == DeviceStatus::Offline));
    }
}
