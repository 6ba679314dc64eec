//! Test support: scriptable adapter and recording sink
//!
//! Used by unit and integration tests to drive the registry, mirror pumps,
//! and hub without real device tooling.

use async_trait::async_trait;
use chrono::Utc;
use devicelab_common::{
    CommandKind, Device, DeviceAdapter, DeviceCapabilities, DeviceFacts, DeviceKind, DeviceStatus,
    DiscoveredDevice, Event, EventSink, LabError, Orientation, Platform, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted screenshot behavior for the mock adapter
#[derive(Debug, Clone)]
pub enum ShotScript {
    /// Return a tiny PNG after the given delay
    Ok(Duration),
    /// Fail with a resource-exhaustion error
    Exhausted,
    /// Fail with a tool error
    ToolFailure,
}

/// Adapter whose enumeration and capture behavior is set by the test
pub struct MockAdapter {
    platform: Platform,
    serials: Mutex<Vec<String>>,
    fail_enumerate: Mutex<bool>,
    shot_script: Mutex<ShotScript>,
    pub shots_taken: AtomicUsize,
}

impl MockAdapter {
    pub fn new(platform: Platform, serials: &[&str]) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            platform,
            serials: Mutex::new(serials.iter().map(|s| s.to_string()).collect()),
            fail_enumerate: Mutex::new(false),
            shot_script: Mutex::new(ShotScript::Ok(Duration::from_millis(10))),
            shots_taken: AtomicUsize::new(0),
        })
    }

    pub fn set_serials(&self, serials: &[&str]) {
        *self.serials.lock().unwrap() = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_fail_enumerate(&self, fail: bool) {
        *self.fail_enumerate.lock().unwrap() = fail;
    }

    pub fn set_shot_script(&self, script: ShotScript) {
        *self.shot_script.lock().unwrap() = script;
    }
}

/// 1x1 transparent PNG used as the mock frame payload
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[async_trait]
impl DeviceAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        if *self.fail_enumerate.lock().unwrap() {
            return Err(LabError::tool("enumeration unavailable"));
        }
        Ok(self
            .serials
            .lock()
            .unwrap()
            .iter()
            .map(|serial| DiscoveredDevice {
                serial: serial.clone(),
                kind: DeviceKind::Physical,
            })
            .collect())
    }

    async fn facts(&self, serial: &str) -> Result<DeviceFacts> {
        Ok(DeviceFacts {
            kind: DeviceKind::Physical,
            name: format!("Mock {}", serial),
            model: "Mock".to_string(),
            manufacturer: "Acme".to_string(),
            os_version: "14".to_string(),
            api_level: Some(34),
            resolution: Some((1080, 2400)),
            orientation: Orientation::Portrait,
            capabilities: DeviceCapabilities::default(),
            properties: HashMap::new(),
            battery: 85,
        })
    }

    async fn battery(&self, _serial: &str) -> Result<u8> {
        Ok(85)
    }

    async fn screenshot(&self, serial: &str) -> Result<Vec<u8>> {
        self.shots_taken.fetch_add(1, Ordering::SeqCst);
        let script = self.shot_script.lock().unwrap().clone();
        match script {
            ShotScript::Ok(delay) => {
                tokio::time::sleep(delay).await;
                Ok(TINY_PNG.to_vec())
            }
            ShotScript::Exhausted => Err(LabError::resource_exhaustion(format!(
                "capture resources unavailable for {}",
                serial
            ))),
            ShotScript::ToolFailure => {
                Err(LabError::tool(format!("capture failed for {}", serial)))
            }
        }
    }

    async fn tap(&self, _serial: &str, _x: u32, _y: u32) -> Result<()> {
        Ok(())
    }

    async fn swipe(
        &self,
        _serial: &str,
        _from: (u32, u32),
        _to: (u32, u32),
        _duration_ms: Option<u64>,
    ) -> Result<()> {
        Ok(())
    }

    async fn drag(
        &self,
        _serial: &str,
        _from: (u32, u32),
        _to: (u32, u32),
        _duration_ms: Option<u64>,
    ) -> Result<()> {
        Ok(())
    }

    async fn key_event(&self, _serial: &str, _keycode: u32) -> Result<()> {
        Ok(())
    }

    async fn input_text(&self, _serial: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn install_app(&self, _serial: &str, _path: &std::path::Path) -> Result<()> {
        Ok(())
    }

    async fn uninstall_app(&self, _serial: &str, _package: &str) -> Result<()> {
        Ok(())
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        if self.platform == Platform::Android {
            Ok(format!("{} ran: {}", serial, command))
        } else {
            Err(LabError::unsupported(format!(
                "shell is not supported for {} devices ({})",
                self.platform, serial
            )))
        }
    }

    fn supports(&self, kind: CommandKind) -> bool {
        self.platform == Platform::Android || kind != CommandKind::Shell
    }
}

/// Sink that records every published event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// A fully formed online device record for tests
pub fn sample_device(id: &str, serial: &str, platform: Platform) -> Device {
    Device {
        id: id.to_string(),
        serial: serial.to_string(),
        platform,
        kind: DeviceKind::Physical,
        name: format!("Mock {}", serial),
        model: "Mock".to_string(),
        manufacturer: "Acme".to_string(),
        os_version: "14".to_string(),
        api_level: Some(34),
        resolution: Some((1080, 2400)),
        orientation: Orientation::Portrait,
        capabilities: DeviceCapabilities::default(),
        properties: HashMap::new(),
        status: DeviceStatus::Online,
        battery: 85,
        reserved_by: None,
        reserved_at: None,
        connected_at: Utc::now(),
        last_seen: Utc::now(),
    }
}
