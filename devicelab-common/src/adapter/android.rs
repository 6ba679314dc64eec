//! Android adapter over the debug bridge
//!
//! Wraps the `adb` command line: device enumeration, property and battery
//! parsing, input injection, install/uninstall, shell execution, screenshot
//! capture, and logcat tailing.

use super::{DeviceAdapter, DeviceFacts, DiscoveredDevice, LogSink, LogTailHandle, ToolRunner};
use crate::{
    CommandKind, DeviceCapabilities, DeviceKind, LabError, LogEntry, LogLevel, Orientation,
    Platform, Result,
};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DEFAULT_SWIPE_MS: u64 = 500;
const DEFAULT_DRAG_MS: u64 = 1000;

/// Emulator model strings that are never a useful display name
const EMULATOR_PLACEHOLDERS: &[&str] = &[
    "Android SDK built for x86",
    "Android SDK built for x86_64",
    "Android SDK built for arm64",
    "AOSP on IA Emulator",
    "generic_x86",
];

fn prop_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([^\]]+)\]:\s*\[([^\]]*)\]").expect("prop pattern"))
}

fn battery_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"level:\s*(\d+)").expect("battery pattern"))
}

fn wm_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"size:\s*(\d+)x(\d+)").expect("wm size pattern"))
}

fn logcat_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `logcat -v time`: "01-02 12:34:56.789 I/ActivityManager( 123): message"
    RE.get_or_init(|| {
        Regex::new(r"^\d{2}-\d{2}\s+\S+\s+([VDIWEF])/([^(]+)\(\s*\d+\):\s?(.*)$")
            .expect("logcat pattern")
    })
}

/// Adapter over the Android debug bridge
pub struct AndroidAdapter {
    adb: String,
    runner: ToolRunner,
    screenshot_timeout: Duration,
}

impl AndroidAdapter {
    pub fn new(adb_path: Option<String>, command_timeout: Duration, screenshot_timeout: Duration) -> Self {
        Self {
            adb: adb_path.unwrap_or_else(|| "adb".to_string()),
            runner: ToolRunner::new(command_timeout),
            screenshot_timeout,
        }
    }

    async fn run_adb(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full: Vec<&str> = vec!["-s", serial];
        full.extend_from_slice(args);
        self.runner.run(&self.adb, &full).await
    }

    async fn getprops(&self, serial: &str) -> Result<HashMap<String, String>> {
        let output = self.run_adb(serial, &["shell", "getprop"]).await?;
        let props = parse_properties(&output);
        if props.is_empty() {
            return Err(LabError::tool(format!(
                "property dump for {} produced no parseable lines",
                serial
            )));
        }
        Ok(props)
    }

    async fn query_resolution(&self, serial: &str) -> Result<(u32, u32)> {
        let output = self.run_adb(serial, &["shell", "wm", "size"]).await?;
        wm_size_re()
            .captures(&output)
            .and_then(|c| {
                let w = c[1].parse().ok()?;
                let h = c[2].parse().ok()?;
                Some((w, h))
            })
            .ok_or_else(|| {
                LabError::tool(format!("could not parse screen size for {}: {}", serial, output.trim()))
            })
    }

    async fn query_orientation(&self, serial: &str) -> Orientation {
        match self.run_adb(serial, &["shell", "dumpsys", "input"]).await {
            Ok(output) => {
                for line in output.lines() {
                    if let Some(idx) = line.find("SurfaceOrientation:") {
                        let value = line[idx + "SurfaceOrientation:".len()..].trim();
                        return match value.chars().next() {
                            Some('1') | Some('3') => Orientation::Landscape,
                            _ => Orientation::Portrait,
                        };
                    }
                }
                Orientation::Portrait
            }
            Err(e) => {
                debug!("Orientation query failed for {}: {}", serial, e);
                Orientation::Portrait
            }
        }
    }

    async fn query_capabilities(&self, serial: &str) -> DeviceCapabilities {
        let features = match self.run_adb(serial, &["shell", "pm", "list", "features"]).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Feature query failed for {}: {}", serial, e);
                String::new()
            }
        };
        DeviceCapabilities {
            touchscreen: features.contains("android.hardware.touchscreen") || features.is_empty(),
            camera: features.contains("android.hardware.camera"),
            wifi: features.contains("android.hardware.wifi") || features.is_empty(),
            bluetooth: features.contains("android.hardware.bluetooth"),
            gps: features.contains("android.hardware.location.gps"),
            nfc: features.contains("android.hardware.nfc"),
            fingerprint: features.contains("android.hardware.fingerprint"),
            accelerometer: features.contains("android.hardware.sensor.accelerometer"),
            gyroscope: features.contains("android.hardware.sensor.gyroscope"),
        }
    }
}

#[async_trait]
impl DeviceAdapter for AndroidAdapter {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        let output = self.runner.run(&self.adb, &["devices"]).await?;
        let mut devices = Vec::new();
        for line in output.lines().skip(1) {
            let mut parts = line.split_whitespace();
            let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
                continue;
            };
            // offline and unauthorized entries are excluded from discovery
            if state != "device" {
                debug!("Skipping {} in state {}", serial, state);
                continue;
            }
            devices.push(DiscoveredDevice {
                serial: serial.to_string(),
                kind: DeviceKind::Physical,
            });
        }
        Ok(devices)
    }

    async fn facts(&self, serial: &str) -> Result<DeviceFacts> {
        let properties = self.getprops(serial).await?;
        let battery = self.battery(serial).await?;
        let resolution = self.query_resolution(serial).await?;
        let orientation = self.query_orientation(serial).await;
        let capabilities = self.query_capabilities(serial).await;

        let model = properties
            .get("ro.product.model")
            .cloned()
            .unwrap_or_default();
        let manufacturer = properties
            .get("ro.product.manufacturer")
            .cloned()
            .unwrap_or_default();
        let os_version = properties
            .get("ro.build.version.release")
            .cloned()
            .unwrap_or_default();
        let api_level = properties
            .get("ro.build.version.sdk")
            .and_then(|v| v.parse().ok());

        Ok(DeviceFacts {
            kind: DeviceKind::Physical,
            name: derive_device_name(&properties),
            model,
            manufacturer,
            os_version,
            api_level,
            resolution: Some(resolution),
            orientation,
            capabilities,
            properties,
            battery,
        })
    }

    async fn battery(&self, serial: &str) -> Result<u8> {
        let output = self.run_adb(serial, &["shell", "dumpsys", "battery"]).await?;
        battery_level_re()
            .captures(&output)
            .and_then(|c| c[1].parse::<u8>().ok())
            .map(|level| level.min(100))
            .ok_or_else(|| LabError::tool(format!("could not parse battery level for {}", serial)))
    }

    async fn screenshot(&self, serial: &str) -> Result<Vec<u8>> {
        let output = self
            .runner
            .output(
                &self.adb,
                &["-s", serial, "exec-out", "screencap", "-p"],
                self.screenshot_timeout,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // transient EAGAIN-style noise is a shed signal, not a tool fault
            if stderr.contains("Resource temporarily unavailable") {
                return Err(LabError::resource_exhaustion(format!(
                    "screencap resources unavailable for {}",
                    serial
                )));
            }
            return Err(LabError::tool(format!(
                "screencap failed for {}: {}",
                serial,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(LabError::tool(format!("screencap produced no data for {}", serial)));
        }
        Ok(output.stdout)
    }

    async fn tap(&self, serial: &str, x: u32, y: u32) -> Result<()> {
        self.run_adb(serial, &["shell", "input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        Ok(())
    }

    async fn swipe(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let duration = duration_ms.unwrap_or(DEFAULT_SWIPE_MS);
        self.run_adb(
            serial,
            &[
                "shell",
                "input",
                "swipe",
                &from.0.to_string(),
                &from.1.to_string(),
                &to.0.to_string(),
                &to.1.to_string(),
                &duration.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn drag(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()> {
        // a drag is a slow swipe: at least double the swipe pacing
        let duration = duration_ms.unwrap_or(DEFAULT_DRAG_MS).max(DEFAULT_SWIPE_MS * 2);
        self.swipe(serial, from, to, Some(duration)).await
    }

    async fn key_event(&self, serial: &str, keycode: u32) -> Result<()> {
        self.run_adb(serial, &["shell", "input", "keyevent", &keycode.to_string()])
            .await?;
        Ok(())
    }

    async fn input_text(&self, serial: &str, text: &str) -> Result<()> {
        let escaped = escape_input_text(text);
        self.run_adb(serial, &["shell", "input", "text", &escaped]).await?;
        Ok(())
    }

    async fn install_app(&self, serial: &str, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let output = self.run_adb(serial, &["install", "-r", &path_str]).await?;
        if output.contains("Success") {
            info!("Installed {} on {}", path_str, serial);
            Ok(())
        } else {
            Err(LabError::tool(format!(
                "install on {} did not report success: {}",
                serial,
                output.trim()
            )))
        }
    }

    async fn uninstall_app(&self, serial: &str, package: &str) -> Result<()> {
        let output = self.run_adb(serial, &["uninstall", package]).await?;
        if output.contains("Success") {
            Ok(())
        } else {
            Err(LabError::tool(format!(
                "uninstall of {} on {} did not report success: {}",
                package,
                serial,
                output.trim()
            )))
        }
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        self.run_adb(serial, &["shell", command]).await
    }

    async fn tail_logs(&self, serial: &str, device_id: &str, sink: LogSink) -> Result<LogTailHandle> {
        let mut child = Command::new(&self.adb)
            .args(["-s", serial, "logcat", "-v", "time"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LabError::tool(format!("failed to start logcat for {}: {}", serial, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LabError::tool(format!("logcat stdout unavailable for {}", serial)))?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let device_id = device_id.to_string();
        let serial_owned = serial.to_string();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(entry) = parse_logcat_line(&device_id, &line) {
                                    sink(entry);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!("logcat read error for {}: {}", serial_owned, e);
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!("logcat child for {} already gone: {}", serial_owned, e);
            }
            debug!("Log tail for {} stopped", serial_owned);
        });

        info!("Started log tail for {}", serial);
        Ok(LogTailHandle::new(stop_tx, task))
    }

    fn supports(&self, _kind: CommandKind) -> bool {
        true
    }
}

/// Parse `[key]: [value]` property-dump lines
pub fn parse_properties(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in output.lines() {
        if let Some(caps) = prop_line_re().captures(line.trim()) {
            props.insert(caps[1].to_string(), caps[2].to_string());
        }
    }
    props
}

/// Derive a friendly display name from the property map
///
/// Prefers the AVD name, then the product model unless it is an SDK or
/// emulator placeholder, then manufacturer + model.
pub fn derive_device_name(props: &HashMap<String, String>) -> String {
    if let Some(avd) = props.get("ro.boot.qemu.avd_name").filter(|v| !v.is_empty()) {
        return avd.replace('_', " ");
    }

    let model = props.get("ro.product.model").cloned().unwrap_or_default();
    let manufacturer = props
        .get("ro.product.manufacturer")
        .cloned()
        .unwrap_or_default();

    let is_placeholder = EMULATOR_PLACEHOLDERS.contains(&model.as_str());
    if !model.is_empty() && !model.starts_with("sdk_") && !is_placeholder {
        return model;
    }
    if model.starts_with("sdk_") || is_placeholder {
        return "Android Emulator".to_string();
    }

    let combined = format!("{} {}", manufacturer, model).trim().to_string();
    if combined.is_empty() {
        "Android Device".to_string()
    } else {
        combined
    }
}

/// Escape text for `input text`: spaces become %s, shell metacharacters are quoted out
fn escape_input_text(text: &str) -> String {
    text.replace(' ', "%s")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('&', "\\&")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

/// Parse one `logcat -v time` line into a log entry
pub fn parse_logcat_line(device_id: &str, line: &str) -> Option<LogEntry> {
    let caps = logcat_line_re().captures(line)?;
    let level = match &caps[1] {
        "V" => LogLevel::Verbose,
        "D" => LogLevel::Debug,
        "I" => LogLevel::Info,
        "W" => LogLevel::Warn,
        "E" => LogLevel::Error,
        "F" => LogLevel::Fatal,
        _ => return None,
    };
    Some(LogEntry::new(
        device_id,
        level,
        caps[2].trim(),
        caps[3].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let dump = "[ro.product.model]: [Pixel 7]\n\
                    [ro.product.manufacturer]: [Google]\n\
                    [ro.build.version.sdk]: [34]\n\
                    malformed line";
        let props = parse_properties(dump);
        assert_eq!(props.get("ro.product.model").unwrap(), "Pixel 7");
        assert_eq!(props.get("ro.build.version.sdk").unwrap(), "34");
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_derive_name_prefers_avd() {
        let mut props = HashMap::new();
        props.insert("ro.boot.qemu.avd_name".to_string(), "Pixel_7_API_34".to_string());
        props.insert("ro.product.model".to_string(), "sdk_gphone64_x86_64".to_string());
        assert_eq!(derive_device_name(&props), "Pixel 7 API 34");
    }

    #[test]
    fn test_derive_name_model_fallbacks() {
        let mut props = HashMap::new();
        props.insert("ro.product.model".to_string(), "SM-G991B".to_string());
        assert_eq!(derive_device_name(&props), "SM-G991B");

        let mut props = HashMap::new();
        props.insert("ro.product.model".to_string(), "sdk_gphone64_x86_64".to_string());
        assert_eq!(derive_device_name(&props), "Android Emulator");

        let mut props = HashMap::new();
        props.insert(
            "ro.product.model".to_string(),
            "Android SDK built for x86".to_string(),
        );
        assert_eq!(derive_device_name(&props), "Android Emulator");

        let mut props = HashMap::new();
        props.insert("ro.product.manufacturer".to_string(), "Samsung".to_string());
        assert_eq!(derive_device_name(&props), "Samsung");

        assert_eq!(derive_device_name(&HashMap::new()), "Android Device");
    }

    #[test]
    fn test_battery_level_parsing() {
        let dump = "Current Battery Service state:\n  AC powered: false\n  level: 85\n  scale: 100";
        let caps = battery_level_re().captures(dump).unwrap();
        assert_eq!(&caps[1], "85");
    }

    #[test]
    fn test_wm_size_parsing() {
        let output = "Physical size: 1080x2400";
        let caps = wm_size_re().captures(output).unwrap();
        assert_eq!(&caps[1], "1080");
        assert_eq!(&caps[2], "2400");
    }

    #[test]
    fn test_parse_logcat_line() {
        let line = "01-02 12:34:56.789 I/ActivityManager(  123): Start proc 456";
        let entry = parse_logcat_line("d-1", line).unwrap();
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.tag, "ActivityManager");
        assert_eq!(entry.message, "Start proc 456");
        assert_eq!(entry.device_id, "d-1");

        assert!(parse_logcat_line("d-1", "--------- beginning of main").is_none());
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
    }

    #[tokio::test]
    async fn test_enumerate_parsing_via_stub() {
        // enumerate() runs the configured binary; point it at a stub that
        // prints a devices table with offline and unauthorized entries
        let script = "#!/bin/sh\n\
            echo 'List of devices attached'\n\
            echo 'emulator-5554\tdevice'\n\
            echo 'ZY22DPH3XK\tunauthorized'\n\
            echo '192.168.1.5:5555\toffline'\n";
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("adb-stub");
        std::fs::write(&stub, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let adapter = AndroidAdapter::new(
            Some(stub.to_string_lossy().into_owned()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let devices = adapter.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
    }
}
