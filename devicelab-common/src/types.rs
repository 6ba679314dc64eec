//! Common types for the device lab controller

use crate::{LabError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// Human-facing label ("Android" / "iOS") for error messages
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Android => write!(f, "android"),
            Platform::Ios => write!(f, "ios"),
        }
    }
}

/// Physical handset or simulator (only meaningful for iOS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Physical,
    Simulator,
}

/// Live status of a device in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unauthorized,
    Reserved,
    InUse,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Reserved => "reserved",
            DeviceStatus::InUse => "in-use",
        };
        write!(f, "{}", s)
    }
}

/// Screen orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

/// Hardware capability flags reported during enrichment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub touchscreen: bool,
    pub camera: bool,
    pub wifi: bool,
    pub bluetooth: bool,
    pub gps: bool,
    pub nfc: bool,
    pub fingerprint: bool,
    pub accelerometer: bool,
    pub gyroscope: bool,
}

/// A device record: identity plus live state, keyed by synthetic id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub serial: String,
    pub platform: Platform,
    pub kind: DeviceKind,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub os_version: String,
    pub api_level: Option<u32>,
    pub resolution: Option<(u32, u32)>,
    pub orientation: Orientation,
    pub capabilities: DeviceCapabilities,
    pub properties: HashMap<String, String>,
    pub status: DeviceStatus,
    pub battery: u8,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Whether a reservation can be granted against this device
    pub fn is_reservable(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    /// Whether a driver server may be started (reserved or in active use)
    pub fn is_held(&self) -> bool {
        matches!(self.status, DeviceStatus::Reserved | DeviceStatus::InUse)
    }
}

/// Status of a reservation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

/// A time-bounded exclusive hold on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    pub purpose: Option<String>,
}

/// Status of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// A period of active device use, nested within (or independent of) a reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// Command kinds accepted over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Tap,
    Swipe,
    Drag,
    Key,
    Text,
    Install,
    Uninstall,
    Shell,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandKind::Tap => "tap",
            CommandKind::Swipe => "swipe",
            CommandKind::Drag => "drag",
            CommandKind::Key => "key",
            CommandKind::Text => "text",
            CommandKind::Install => "install",
            CommandKind::Uninstall => "uninstall",
            CommandKind::Shell => "shell",
        };
        write!(f, "{}", s)
    }
}

/// Typed command payload, one variant per command kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CommandPayload {
    Tap { x: u32, y: u32 },
    Swipe {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Drag {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Key { keycode: u32 },
    Text { text: String },
    Install { path: String },
    Uninstall { package: String },
    Shell { command: String },
}

impl CommandPayload {
    /// Command kind of this payload
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Tap { .. } => CommandKind::Tap,
            CommandPayload::Swipe { .. } => CommandKind::Swipe,
            CommandPayload::Drag { .. } => CommandKind::Drag,
            CommandPayload::Key { .. } => CommandKind::Key,
            CommandPayload::Text { .. } => CommandKind::Text,
            CommandPayload::Install { .. } => CommandKind::Install,
            CommandPayload::Uninstall { .. } => CommandKind::Uninstall,
            CommandPayload::Shell { .. } => CommandKind::Shell,
        }
    }

    /// Per-variant validation, applied at the request boundary
    pub fn validate(&self) -> Result<()> {
        match self {
            CommandPayload::Text { text } if text.is_empty() => {
                Err(LabError::validation("text payload must not be empty"))
            }
            CommandPayload::Install { path } if path.is_empty() => {
                Err(LabError::validation("install payload requires a path"))
            }
            CommandPayload::Uninstall { package } if package.is_empty() => {
                Err(LabError::validation("uninstall payload requires a package"))
            }
            CommandPayload::Shell { command } if command.is_empty() => {
                Err(LabError::validation("shell payload requires a command"))
            }
            CommandPayload::Swipe { duration_ms, .. } | CommandPayload::Drag { duration_ms, .. }
                if duration_ms.is_some_and(|d| d == 0) =>
            {
                Err(LabError::validation("duration must be greater than zero"))
            }
            _ => Ok(()),
        }
    }
}

/// Status of a control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Transient record for a control request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub device_id: String,
    pub payload: CommandPayload,
    pub timestamp: DateTime<Utc>,
    pub status: CommandStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl CommandRecord {
    pub fn new(device_id: String, payload: CommandPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            payload,
            timestamp: Utc::now(),
            status: CommandStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Log severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A log line attributed to a device or to the synthetic "system" source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(device_id: impl Into<String>, level: LogLevel, tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            timestamp: Utc::now(),
            level,
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Log entry from the synthetic "system" source
    pub fn system(level: LogLevel, tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("system", level, tag, message)
    }
}

/// Status of a supervised driver-server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Snapshot of a supervised driver server, as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverServerInfo {
    pub device_id: String,
    pub port: u16,
    pub status: DriverStatus,
    pub started_at: DateTime<Utc>,
}

impl DriverServerInfo {
    /// WebDriver endpoint clients point their automation at
    pub fn endpoint(&self, host: &str) -> String {
        format!("http://{}:{}/wd/hub", host, self.port)
    }
}

/// A single captured screen frame, base64-encoded PNG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenFrame {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: String,
    pub mime_type: String,
}

impl ScreenFrame {
    pub fn png(device_id: impl Into<String>, base64_data: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            timestamp: Utc::now(),
            data: base64_data,
            mime_type: "image/png".to_string(),
        }
    }
}

/// Health snapshot broadcast on the health ticker and served on demand
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub uptime_seconds: u64,
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub reserved_devices: usize,
    pub in_use_devices: usize,
    pub active_sessions: usize,
    pub running_drivers: usize,
    pub subscribers: usize,
}

/// Aggregate counters for the stats and analytics queries
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabStats {
    pub total_devices: usize,
    pub devices_by_status: HashMap<String, usize>,
    pub devices_by_platform: HashMap<String, usize>,
    pub total_reservations: usize,
    pub active_reservations: usize,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub sessions_by_hour: HashMap<String, usize>,
}
