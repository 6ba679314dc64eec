//! iOS adapter over the simulator controller and the physical-device bridge
//!
//! Simulators are driven through `xcrun simctl`; physical devices through
//! the libimobiledevice tools (`idevice_id`, `ideviceinfo`,
//! `idevicescreenshot`, `ideviceinstaller`). Input goes through the `idb`
//! point-coordinate driver, which takes points rather than pixels — the
//! adapter keeps a per-device scale cache to convert screenshot pixel
//! coordinates before forwarding them.

use super::{DeviceAdapter, DeviceFacts, DiscoveredDevice, ToolRunner};
use crate::{
    CommandKind, DeviceCapabilities, DeviceKind, LabError, Orientation, Platform, Result,
};
use async_trait::async_trait;
use image::GenericImageView;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_SWIPE_MS: u64 = 500;
const DEFAULT_DRAG_MS: u64 = 1000;

/// Scale cache entries are trusted for five minutes
const SCALE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Retina scale assumed when detection fails
const DEFAULT_SCALE: f64 = 3.0;

/// JSON shape of `xcrun simctl list devices -j`
#[derive(Debug, Deserialize)]
struct SimctlOutput {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

/// Adapter over the iOS simulator controller and device bridge
pub struct IosAdapter {
    runner: ToolRunner,
    screenshot_timeout: Duration,
    /// device-kind classification cache, refreshed on every enumerate
    kinds: RwLock<HashMap<String, DeviceKind>>,
    /// pixel-to-point scale cache inferred from screenshot width
    scales: RwLock<HashMap<String, (f64, Instant)>>,
}

impl IosAdapter {
    pub fn new(command_timeout: Duration, screenshot_timeout: Duration) -> Self {
        Self {
            runner: ToolRunner::new(command_timeout),
            screenshot_timeout,
            kinds: RwLock::new(HashMap::new()),
            scales: RwLock::new(HashMap::new()),
        }
    }

    fn cached_kind(&self, serial: &str) -> Option<DeviceKind> {
        self.kinds.read().ok()?.get(serial).copied()
    }

    fn remember_kind(&self, serial: &str, kind: DeviceKind) {
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert(serial.to_string(), kind);
        }
    }

    async fn classify(&self, serial: &str) -> Result<DeviceKind> {
        if let Some(kind) = self.cached_kind(serial) {
            return Ok(kind);
        }
        // repopulates the classification cache as a side effect
        let discovered = self.enumerate().await?;
        discovered
            .into_iter()
            .find(|d| d.serial == serial)
            .map(|d| d.kind)
            .ok_or_else(|| LabError::not_found("device", serial))
    }

    async fn list_simulators(&self) -> Result<Vec<SimctlDevice>> {
        let output = self
            .runner
            .run("xcrun", &["simctl", "list", "devices", "-j"])
            .await?;
        let parsed: SimctlOutput = serde_json::from_str(&output)
            .map_err(|e| LabError::tool(format!("failed to parse simctl output: {}", e)))?;
        Ok(parsed
            .devices
            .into_values()
            .flatten()
            .filter(|d| d.is_available != Some(false))
            .collect())
    }

    async fn simulator_entry(&self, udid: &str) -> Result<(SimctlDevice, String)> {
        let output = self
            .runner
            .run("xcrun", &["simctl", "list", "devices", "-j"])
            .await?;
        let parsed: SimctlOutput = serde_json::from_str(&output)
            .map_err(|e| LabError::tool(format!("failed to parse simctl output: {}", e)))?;
        for (runtime, devices) in parsed.devices {
            if let Some(device) = devices.into_iter().find(|d| d.udid == udid) {
                return Ok((device, parse_runtime_version(&runtime)));
            }
        }
        Err(LabError::not_found("simulator", udid))
    }

    async fn physical_info(&self, udid: &str) -> Result<HashMap<String, String>> {
        let output = self.runner.run("ideviceinfo", &["-u", udid]).await?;
        let info = parse_key_value_lines(&output);
        if info.is_empty() {
            return Err(LabError::tool(format!(
                "ideviceinfo produced no parseable output for {}",
                udid
            )));
        }
        Ok(info)
    }

    /// Pixel-to-point scale for the device, from cache or a fresh screenshot
    async fn scale_for(&self, serial: &str) -> f64 {
        if let Ok(scales) = self.scales.read() {
            if let Some((scale, at)) = scales.get(serial) {
                if at.elapsed() < SCALE_CACHE_TTL {
                    return *scale;
                }
            }
        }

        let scale = match self.screenshot(serial).await {
            Ok(png) => match image::load_from_memory(&png) {
                Ok(img) => {
                    let (width, _) = img.dimensions();
                    if width > 800 {
                        3.0
                    } else {
                        2.0
                    }
                }
                Err(e) => {
                    debug!("Scale detection could not decode screenshot for {}: {}", serial, e);
                    return DEFAULT_SCALE;
                }
            },
            Err(e) => {
                debug!("Scale detection screenshot failed for {}: {}", serial, e);
                return DEFAULT_SCALE;
            }
        };

        if let Ok(mut scales) = self.scales.write() {
            scales.insert(serial.to_string(), (scale, Instant::now()));
        }
        scale
    }

    /// Convert a pixel coordinate to driver points
    async fn to_points(&self, serial: &str, x: u32, y: u32) -> (u32, u32) {
        let scale = self.scale_for(serial).await;
        (
            (x as f64 / scale).round() as u32,
            (y as f64 / scale).round() as u32,
        )
    }

    async fn idb_ui(&self, udid: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["ui"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["--udid", udid]);
        self.runner.run("idb", &full).await.map(|_| ())
    }

    async fn simulator_screenshot(&self, udid: &str) -> Result<Vec<u8>> {
        let file = tempfile::Builder::new()
            .prefix("devicelab-shot-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| LabError::tool(format!("failed to create temp file: {}", e)))?;
        let path = file.path().to_string_lossy().into_owned();

        self.runner
            .run_with_timeout(
                "xcrun",
                &["simctl", "io", udid, "screenshot", &path],
                self.screenshot_timeout,
            )
            .await?;

        // the temp file is unlinked when `file` drops, on every path
        read_non_empty(file.path(), udid)
    }

    /// Physical-device capture with the fallback chain: primary tool, the
    /// Python tooling, developer-image mount plus retry, the configurator
    /// utility, and finally a generated placeholder
    async fn physical_screenshot(&self, udid: &str, name: &str, model: &str) -> Result<Vec<u8>> {
        let file = tempfile::Builder::new()
            .prefix("devicelab-shot-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| LabError::tool(format!("failed to create temp file: {}", e)))?;
        let path = file.path().to_string_lossy().into_owned();

        let mut first_failure: Option<LabError> = None;

        let primary = self
            .runner
            .run_with_timeout(
                "idevicescreenshot",
                &["-u", udid, &path],
                self.screenshot_timeout,
            )
            .await;
        match primary {
            Ok(_) => {
                if let Ok(bytes) = read_non_empty(file.path(), udid) {
                    return Ok(bytes);
                }
            }
            Err(e) => first_failure = Some(e),
        }

        // alternative Python tooling
        if self
            .runner
            .run_with_timeout(
                "pymobiledevice3",
                &["developer", "dvt", "screenshot", &path, "--udid", udid],
                self.screenshot_timeout,
            )
            .await
            .is_ok()
        {
            if let Ok(bytes) = read_non_empty(file.path(), udid) {
                return Ok(bytes);
            }
        }

        // mount the developer disk image, then retry the primary tool
        if self
            .runner
            .run("ideviceimagemounter", &["-u", udid])
            .await
            .is_ok()
            && self
                .runner
                .run_with_timeout(
                    "idevicescreenshot",
                    &["-u", udid, &path],
                    self.screenshot_timeout,
                )
                .await
                .is_ok()
        {
            if let Ok(bytes) = read_non_empty(file.path(), udid) {
                return Ok(bytes);
            }
        }

        // external configurator utility
        if self
            .runner
            .run_with_timeout("cfgutil", &["screenshot", &path], self.screenshot_timeout)
            .await
            .is_ok()
        {
            if let Ok(bytes) = read_non_empty(file.path(), udid) {
                return Ok(bytes);
            }
        }

        if let Some(e) = first_failure {
            warn!("All screenshot methods failed for {} ({}); serving placeholder", udid, e);
        }
        placeholder_image(name, model)
    }
}

#[async_trait]
impl DeviceAdapter for IosAdapter {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut devices = Vec::new();

        // booted simulators; failure of one sub-source does not fail the call
        match self.list_simulators().await {
            Ok(simulators) => {
                for simulator in simulators.iter().filter(|d| d.state == "Booted") {
                    devices.push(DiscoveredDevice {
                        serial: simulator.udid.clone(),
                        kind: DeviceKind::Simulator,
                    });
                }
            }
            Err(e) => debug!("Simulator enumeration unavailable: {}", e),
        }

        // physical devices over the bridge
        match self.runner.run("idevice_id", &["-l"]).await {
            Ok(output) => {
                for udid in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    devices.push(DiscoveredDevice {
                        serial: udid.to_string(),
                        kind: DeviceKind::Physical,
                    });
                }
            }
            Err(e) => debug!("Physical device enumeration unavailable: {}", e),
        }

        for device in &devices {
            self.remember_kind(&device.serial, device.kind);
        }
        Ok(devices)
    }

    async fn facts(&self, serial: &str) -> Result<DeviceFacts> {
        match self.classify(serial).await? {
            DeviceKind::Simulator => {
                let (entry, os_version) = self.simulator_entry(serial).await?;
                let resolution = match self.screenshot(serial).await {
                    Ok(png) => image::load_from_memory(&png).ok().map(|img| img.dimensions()),
                    Err(e) => {
                        debug!("Resolution probe failed for {}: {}", serial, e);
                        None
                    }
                };
                let orientation = match resolution {
                    Some((w, h)) if w > h => Orientation::Landscape,
                    _ => Orientation::Portrait,
                };
                Ok(DeviceFacts {
                    kind: DeviceKind::Simulator,
                    name: entry.name.clone(),
                    model: entry.name,
                    manufacturer: "Apple".to_string(),
                    os_version,
                    api_level: None,
                    resolution,
                    orientation,
                    capabilities: DeviceCapabilities {
                        touchscreen: true,
                        camera: false,
                        wifi: true,
                        bluetooth: false,
                        gps: true,
                        nfc: false,
                        fingerprint: false,
                        accelerometer: true,
                        gyroscope: true,
                    },
                    properties: HashMap::new(),
                    battery: 100,
                })
            }
            DeviceKind::Physical => {
                let info = self.physical_info(serial).await?;
                let battery = self.battery(serial).await?;
                let name = info
                    .get("DeviceName")
                    .cloned()
                    .unwrap_or_else(|| "iOS Device".to_string());
                let model = info.get("ProductType").cloned().unwrap_or_default();
                let os_version = info.get("ProductVersion").cloned().unwrap_or_default();
                Ok(DeviceFacts {
                    kind: DeviceKind::Physical,
                    name,
                    model,
                    manufacturer: "Apple".to_string(),
                    os_version,
                    api_level: None,
                    resolution: None,
                    orientation: Orientation::Portrait,
                    capabilities: DeviceCapabilities {
                        touchscreen: true,
                        camera: true,
                        wifi: true,
                        bluetooth: true,
                        gps: true,
                        nfc: true,
                        fingerprint: true,
                        accelerometer: true,
                        gyroscope: true,
                    },
                    properties: info,
                    battery,
                })
            }
        }
    }

    async fn battery(&self, serial: &str) -> Result<u8> {
        match self.classify(serial).await? {
            DeviceKind::Simulator => Ok(100),
            DeviceKind::Physical => {
                let output = self
                    .runner
                    .run(
                        "ideviceinfo",
                        &["-u", serial, "--domain", "com.apple.mobile.battery"],
                    )
                    .await?;
                parse_key_value_lines(&output)
                    .get("BatteryCurrentCapacity")
                    .and_then(|v| v.parse::<u8>().ok())
                    .map(|level| level.min(100))
                    .ok_or_else(|| {
                        LabError::tool(format!("could not parse battery level for {}", serial))
                    })
            }
        }
    }

    async fn screenshot(&self, serial: &str) -> Result<Vec<u8>> {
        match self.classify(serial).await? {
            DeviceKind::Simulator => self.simulator_screenshot(serial).await,
            DeviceKind::Physical => {
                // best-effort identity for the placeholder annotation
                let (name, model) = match self.physical_info(serial).await {
                    Ok(info) => (
                        info.get("DeviceName").cloned().unwrap_or_default(),
                        info.get("ProductType").cloned().unwrap_or_default(),
                    ),
                    Err(_) => (serial.to_string(), String::new()),
                };
                self.physical_screenshot(serial, &name, &model).await
            }
        }
    }

    async fn tap(&self, serial: &str, x: u32, y: u32) -> Result<()> {
        let (px, py) = self.to_points(serial, x, y).await;
        let result = self
            .idb_ui(serial, &["tap", &px.to_string(), &py.to_string()])
            .await;
        if let Err(primary) = result {
            // legacy fallback: synthesized window-relative mouse events
            warn!("idb tap failed for {} ({}); trying legacy mouse events", serial, primary);
            self.runner
                .run("cliclick", &[&format!("c:{},{}", px, py)])
                .await
                .map_err(|_| primary)?;
        }
        Ok(())
    }

    async fn swipe(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()> {
        if self.classify(serial).await? == DeviceKind::Physical {
            return Err(LabError::unsupported(format!(
                "swipe is not implemented for physical iOS devices ({})",
                serial
            )));
        }
        let duration = duration_ms.unwrap_or(DEFAULT_SWIPE_MS);
        let (x1, y1) = self.to_points(serial, from.0, from.1).await;
        let (x2, y2) = self.to_points(serial, to.0, to.1).await;
        let seconds = format!("{:.2}", duration as f64 / 1000.0);
        self.idb_ui(
            serial,
            &[
                "swipe",
                &x1.to_string(),
                &y1.to_string(),
                &x2.to_string(),
                &y2.to_string(),
                "--duration",
                &seconds,
            ],
        )
        .await
    }

    async fn drag(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let duration = duration_ms.unwrap_or(DEFAULT_DRAG_MS).max(DEFAULT_SWIPE_MS * 2);
        self.swipe(serial, from, to, Some(duration)).await
    }

    async fn key_event(&self, serial: &str, keycode: u32) -> Result<()> {
        if self.classify(serial).await? == DeviceKind::Physical {
            return Err(LabError::unsupported(format!(
                "key events are not implemented for physical iOS devices ({})",
                serial
            )));
        }
        self.idb_ui(serial, &["key", &keycode.to_string()]).await
    }

    async fn input_text(&self, serial: &str, text: &str) -> Result<()> {
        if self.classify(serial).await? == DeviceKind::Physical {
            return Err(LabError::unsupported(format!(
                "text input is not implemented for physical iOS devices ({})",
                serial
            )));
        }
        self.idb_ui(serial, &["text", text]).await
    }

    async fn install_app(&self, serial: &str, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        match self.classify(serial).await? {
            DeviceKind::Simulator => {
                self.runner
                    .run("xcrun", &["simctl", "install", serial, &path_str])
                    .await?;
            }
            DeviceKind::Physical => {
                self.runner
                    .run("ideviceinstaller", &["-u", serial, "-i", &path_str])
                    .await?;
            }
        }
        info!("Installed {} on {}", path_str, serial);
        Ok(())
    }

    async fn uninstall_app(&self, serial: &str, package: &str) -> Result<()> {
        match self.classify(serial).await? {
            DeviceKind::Simulator => {
                self.runner
                    .run("xcrun", &["simctl", "uninstall", serial, package])
                    .await?;
            }
            DeviceKind::Physical => {
                self.runner
                    .run("ideviceinstaller", &["-u", serial, "-U", package])
                    .await?;
            }
        }
        Ok(())
    }

    fn supports(&self, kind: CommandKind) -> bool {
        !matches!(kind, CommandKind::Shell)
    }

    fn invalidate(&self, serial: &str) {
        if let Ok(mut scales) = self.scales.write() {
            scales.remove(serial);
        }
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.remove(serial);
        }
    }
}

/// "com.apple.CoreSimulator.SimRuntime.iOS-17-2" -> "17.2"
fn parse_runtime_version(identifier: &str) -> String {
    identifier
        .rsplit('.')
        .next()
        .and_then(|suffix| suffix.split_once('-'))
        .map(|(_, version)| version.replace('-', "."))
        .unwrap_or_else(|| identifier.to_string())
}

/// Parse `key: value` output lines from the device-info tool
fn parse_key_value_lines(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() && !key.contains(' ') {
                map.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    map
}

fn read_non_empty(path: &Path, serial: &str) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .map_err(|e| LabError::tool(format!("failed to read screenshot for {}: {}", serial, e)))?;
    if bytes.is_empty() {
        return Err(LabError::tool(format!(
            "screenshot file for {} is empty",
            serial
        )));
    }
    Ok(bytes)
}

/// Generate a PNG placeholder for devices no capture method can reach.
/// Tries the image-processing utility first for a text annotation, then
/// synthesizes a plain frame in-process.
fn placeholder_image(name: &str, model: &str) -> Result<Vec<u8>> {
    let label = if model.is_empty() {
        name.to_string()
    } else {
        format!("{} ({})", name, model)
    };

    if let Ok(file) = tempfile::Builder::new()
        .prefix("devicelab-placeholder-")
        .suffix(".png")
        .tempfile()
    {
        let path = file.path().to_string_lossy().into_owned();
        let annotated = std::process::Command::new("magick")
            .args([
                "-size",
                "375x667",
                "xc:#2d2d2d",
                "-fill",
                "white",
                "-gravity",
                "center",
                "-annotate",
                "0",
                &label,
                &path,
            ])
            .output();
        if matches!(annotated, Ok(ref out) if out.status.success()) {
            if let Ok(bytes) = std::fs::read(file.path()) {
                if !bytes.is_empty() {
                    return Ok(bytes);
                }
            }
        }
    }

    let img = image::RgbaImage::from_pixel(375, 667, image::Rgba([45, 45, 45, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| LabError::tool(format!("failed to encode placeholder: {}", e)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runtime_version() {
        assert_eq!(
            parse_runtime_version("com.apple.CoreSimulator.SimRuntime.iOS-17-2"),
            "17.2"
        );
        assert_eq!(
            parse_runtime_version("com.apple.CoreSimulator.SimRuntime.iOS-16-0"),
            "16.0"
        );
    }

    #[test]
    fn test_parse_simctl_json() {
        let json = r#"{
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
                    {"udid": "ABC-123", "name": "iPhone 15 Pro", "state": "Booted", "isAvailable": true},
                    {"udid": "DEF-456", "name": "iPhone 14", "state": "Shutdown", "isAvailable": true},
                    {"udid": "GHI-789", "name": "Broken", "state": "Booted", "isAvailable": false}
                ]
            }
        }"#;
        let parsed: SimctlOutput = serde_json::from_str(json).unwrap();
        let booted: Vec<_> = parsed
            .devices
            .values()
            .flatten()
            .filter(|d| d.state == "Booted" && d.is_available != Some(false))
            .collect();
        assert_eq!(booted.len(), 1);
        assert_eq!(booted[0].udid, "ABC-123");
    }

    #[test]
    fn test_parse_key_value_lines() {
        let output = "DeviceName: Dev iPhone\n\
                      ProductType: iPhone14,2\n\
                      ProductVersion: 17.1\n\
                      not a pair";
        let info = parse_key_value_lines(output);
        assert_eq!(info.get("DeviceName").unwrap(), "Dev iPhone");
        assert_eq!(info.get("ProductType").unwrap(), "iPhone14,2");
        assert_eq!(info.len(), 3);
    }

    #[test]
    fn test_placeholder_is_valid_png() {
        let bytes = placeholder_image("Dev iPhone", "iPhone14,2").unwrap();
        assert!(!bytes.is_empty());
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.dimensions(), (375, 667));
    }

    #[test]
    fn test_scale_inference_thresholds() {
        // width > 800 implies the x3 retina family, otherwise x2
        let wide = image::RgbaImage::from_pixel(1170, 2532, image::Rgba([0, 0, 0, 255]));
        let (w, _) = image::DynamicImage::ImageRgba8(wide).dimensions();
        assert!(w > 800);

        let narrow = image::RgbaImage::from_pixel(750, 1334, image::Rgba([0, 0, 0, 255]));
        let (w, _) = image::DynamicImage::ImageRgba8(narrow).dimensions();
        assert!(w <= 800);
    }

    #[tokio::test]
    async fn test_scale_cache_invalidation() {
        let adapter = IosAdapter::new(Duration::from_secs(5), Duration::from_secs(5));
        adapter
            .scales
            .write()
            .unwrap()
            .insert("UDID-1".to_string(), (2.0, Instant::now()));
        adapter.remember_kind("UDID-1", DeviceKind::Simulator);

        adapter.invalidate("UDID-1");
        assert!(adapter.scales.read().unwrap().get("UDID-1").is_none());
        assert!(adapter.cached_kind("UDID-1").is_none());
    }

    #[tokio::test]
    async fn test_point_conversion_uses_cached_scale() {
        let adapter = IosAdapter::new(Duration::from_secs(5), Duration::from_secs(5));
        adapter
            .scales
            .write()
            .unwrap()
            .insert("UDID-1".to_string(), (3.0, Instant::now()));
        let (x, y) = adapter.to_points("UDID-1", 300, 900).await;
        assert_eq!((x, y), (100, 300));
    }

    #[test]
    fn test_shell_not_supported() {
        let adapter = IosAdapter::new(Duration::from_secs(5), Duration::from_secs(5));
        assert!(!adapter.supports(CommandKind::Shell));
        assert!(adapter.supports(CommandKind::Tap));
    }
}
