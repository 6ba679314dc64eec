//! Wire protocol for the realtime channel
//!
//! Every request a client can issue and every event the server pushes is
//! defined here, together with the uniform response envelope. Components
//! publish through the [`EventSink`] trait so that none of them depends on
//! the hub directly; the hub implements the sink and is constructed first.

use crate::{
    CommandPayload, Device, HealthSnapshot, LabError, LogEntry, ReservationStatus, Result,
    ScreenFrame,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A framed client request with a correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Requests accepted on the control channel
///
/// Each variant corresponds to one row of the request surface; payload field
/// names match the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Request {
    ListDevices,
    GetDevice {
        device_id: String,
    },
    RefreshDevices,
    Reserve {
        device_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purpose: Option<String>,
    },
    Release {
        device_id: String,
    },
    StartSession {
        device_id: String,
        user_id: String,
    },
    EndSession {
        session_id: String,
    },
    Command {
        device_id: String,
        payload: CommandPayload,
    },
    InstallApp {
        device_id: String,
        path: String,
    },
    ListSessions,
    GetSession {
        session_id: String,
    },
    DeviceSessions {
        device_id: String,
    },
    UserSessions {
        user_id: String,
    },
    DeviceReservations {
        device_id: String,
    },
    ListReservations {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ReservationStatus>,
    },
    Health,
    Stats,
    StartDriver {
        device_id: String,
    },
    StopDriver {
        device_id: String,
    },
    DriverStatus {
        device_id: String,
    },
    DriverLogs {
        device_id: String,
    },
    ClearDriverLogs {
        device_id: String,
    },
    AutoStart {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purpose: Option<String>,
    },
    ListDrivers,
    Analytics,
    AnalyticsDevices,
    AnalyticsHourly,
    StartMirror {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
    },
    StopMirror {
        device_id: String,
    },
}

/// Uniform response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Successful response carrying a serializable payload
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                message: None,
                error: None,
            },
            Err(e) => Self::fail(&LabError::from(e)),
        }
    }

    /// Successful response with no payload
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            message: None,
            error: None,
        }
    }

    /// Successful response with a human-readable message
    pub fn ok_message<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
            error: None,
        }
    }

    /// Failed response carrying the stable error string
    pub fn fail(err: &LabError) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(err.to_string()),
        }
    }

    /// Build from a result, mapping either arm onto the envelope
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(&data),
            Err(e) => Self::fail(&e),
        }
    }
}

/// Events pushed to realtime subscribers
///
/// Every outbound event carries a wall-clock timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Event {
    DeviceUpdated {
        device: Box<Device>,
        timestamp: DateTime<Utc>,
    },
    DeviceList {
        devices: Vec<Device>,
        timestamp: DateTime<Utc>,
    },
    DeviceLog {
        entry: LogEntry,
        timestamp: DateTime<Utc>,
    },
    SystemHealth {
        health: HealthSnapshot,
        timestamp: DateTime<Utc>,
    },
    ScreenUpdate {
        frame: ScreenFrame,
        timestamp: DateTime<Utc>,
    },
    CommandResult {
        command_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Response {
        request_id: u64,
        envelope: Envelope,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn device_updated(device: Device) -> Self {
        Event::DeviceUpdated {
            device: Box::new(device),
            timestamp: Utc::now(),
        }
    }

    pub fn device_list(devices: Vec<Device>) -> Self {
        Event::DeviceList {
            devices,
            timestamp: Utc::now(),
        }
    }

    pub fn device_log(entry: LogEntry) -> Self {
        Event::DeviceLog {
            entry,
            timestamp: Utc::now(),
        }
    }

    pub fn system_health(health: HealthSnapshot) -> Self {
        Event::SystemHealth {
            health,
            timestamp: Utc::now(),
        }
    }

    pub fn screen_update(frame: ScreenFrame) -> Self {
        Event::ScreenUpdate {
            frame,
            timestamp: Utc::now(),
        }
    }

    pub fn command_result(command_id: String, success: bool, error: Option<String>) -> Self {
        Event::CommandResult {
            command_id,
            success,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn response(request_id: u64, envelope: Envelope) -> Self {
        Event::Response {
            request_id,
            envelope,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>, command_id: Option<String>) -> Self {
        Event::Error {
            message: message.into(),
            command_id,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast sink implemented by the realtime hub
///
/// The registry, session manager, and supervisor publish every state change
/// through this interface; they never hold a reference to the hub itself.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Fan an event out to all subscribers
    async fn publish(&self, event: Event);
}

/// Sink that discards every event, for construction-time wiring and tests
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogLevel;

    #[test]
    fn test_request_frame_wire_format() {
        let frame = RequestFrame {
            id: 7,
            request: Request::Reserve {
                device_id: "d-1".to_string(),
                user_id: "alice".to_string(),
                duration_minutes: Some(120),
                purpose: Some("wdio".to_string()),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"reserve\""));
        assert!(json.contains("\"id\":7"));

        let back: RequestFrame = serde_json::from_str(&json).unwrap();
        match back.request {
            Request::Reserve { device_id, duration_minutes, .. } => {
                assert_eq!(device_id, "d-1");
                assert_eq!(duration_minutes, Some(120));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_request_kind_names_are_kebab_case() {
        let json = serde_json::to_string(&Request::StartMirror {
            device_id: "d-1".to_string(),
            fps: Some(10),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"start-mirror\""));

        let json = serde_json::to_string(&Request::RefreshDevices).unwrap();
        assert!(json.contains("\"kind\":\"refresh-devices\""));
    }

    #[test]
    fn test_envelope_fail_carries_error_string() {
        let envelope = Envelope::fail(&LabError::not_found("device", "nope"));
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_deref(), Some("device not found: nope"));
        assert!(envelope.data.is_none());
    }

    #[test]
    fn test_envelope_from_result() {
        let ok: Result<u32> = Ok(42);
        let envelope = Envelope::from_result(ok);
        assert!(envelope.success);
        assert_eq!(envelope.data, Some(serde_json::json!(42)));

        let err: Result<u32> = Err(LabError::invalid_state("offline"));
        let envelope = Envelope::from_result(err);
        assert!(!envelope.success);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::device_log(LogEntry::system(LogLevel::Info, "driver", "started"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"device-log\""));
        assert!(json.contains("\"timestamp\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::DeviceLog { entry, .. } => assert_eq!(entry.device_id, "system"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
