//! Reservation and session management
//!
//! Arbitrates exclusive access to devices. Reservations are time-bounded
//! holds; sessions are periods of active use nested within (or independent
//! of) a reservation. All device status cascades go through the registry,
//! which is the sole transition authority.

use crate::registry::DeviceRegistry;
use chrono::{Duration as ChronoDuration, Utc};
use devicelab_common::{
    Device, Event, EventSink, LabError, LabStats, Reservation, ReservationStatus, Result, Session,
    SessionConfig, SessionStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Manager for reservation and session records
pub struct SessionManager {
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    reservations: Arc<RwLock<HashMap<String, Reservation>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            reservations: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Grant an exclusive reservation against an online device
    pub async fn reserve(
        &self,
        device_id: &str,
        user_id: &str,
        duration_minutes: Option<u64>,
        purpose: Option<String>,
    ) -> Result<Reservation> {
        if user_id.trim().is_empty() {
            return Err(LabError::validation("userId is required"));
        }
        let duration = duration_minutes.unwrap_or(self.config.default_duration_minutes);

        // the registry enforces device status and holds its lock for the
        // transition; a failure here leaves no reservation record behind
        let device = self.registry.mark_reserved(device_id, user_id).await?;

        let now = Utc::now();
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            start_time: now,
            end_time: now + ChronoDuration::minutes(duration as i64),
            status: ReservationStatus::Active,
            purpose,
        };
        self.reservations
            .write()
            .await
            .insert(reservation.id.clone(), reservation.clone());

        info!(
            "Reserved device {} for {} ({} minutes)",
            device_id, user_id, duration
        );
        self.sink.publish(Event::device_updated(device)).await;
        Ok(reservation)
    }

    /// Release a device: completes its active reservation (if any) and
    /// returns the device to the pool unconditionally
    pub async fn release(&self, device_id: &str) -> Result<Device> {
        {
            let mut reservations = self.reservations.write().await;
            if let Some(active) = reservations
                .values_mut()
                .find(|r| r.device_id == device_id && r.status == ReservationStatus::Active)
            {
                active.status = ReservationStatus::Completed;
                active.end_time = Utc::now();
            }
        }

        let device = self.registry.mark_released(device_id).await?;
        info!("Released device {}", device_id);
        self.sink.publish(Event::device_updated(device.clone())).await;
        Ok(device)
    }

    /// Open a session on a reserved device; the device moves to in-use
    pub async fn create_session(&self, device_id: &str, user_id: &str) -> Result<Session> {
        if user_id.trim().is_empty() {
            return Err(LabError::validation("userId is required"));
        }
        {
            let sessions = self.sessions.read().await;
            if sessions
                .values()
                .any(|s| s.device_id == device_id && s.status == SessionStatus::Active)
            {
                return Err(LabError::invalid_state(format!(
                    "device {} already has an active session",
                    device_id
                )));
            }
        }

        // the registry rejects any device that is not currently reserved
        let device = self.registry.mark_in_use(device_id).await?;

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());

        info!("Session {} started on {} by {}", session.id, device_id, user_id);
        self.sink.publish(Event::device_updated(device)).await;
        Ok(session)
    }

    /// Close a session; the device returns to reserved when its reservation
    /// still holds, otherwise to online
    pub async fn end_session(&self, session_id: &str) -> Result<Session> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| LabError::not_found("session", session_id))?;
            if session.status != SessionStatus::Active {
                return Err(LabError::invalid_state(format!(
                    "session {} is not active",
                    session_id
                )));
            }
            session.status = SessionStatus::Completed;
            session.end_time = Some(Utc::now());
            session.clone()
        };

        let reservation_active = self
            .active_reservation(&session.device_id)
            .await
            .is_some();
        let device = self
            .registry
            .mark_session_ended(&session.device_id, reservation_active)
            .await?;

        info!("Session {} ended on {}", session_id, session.device_id);
        self.sink.publish(Event::device_updated(device)).await;
        Ok(session)
    }

    /// The sole active reservation for a device, if one exists
    pub async fn active_reservation(&self, device_id: &str) -> Option<Reservation> {
        let reservations = self.reservations.read().await;
        reservations
            .values()
            .find(|r| r.device_id == device_id && r.status == ReservationStatus::Active)
            .cloned()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| LabError::not_found("session", session_id))
    }

    /// The active session on a device, if one exists
    pub async fn active_session(&self, device_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.device_id == device_id && s.status == SessionStatus::Active)
            .cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        list
    }

    pub async fn device_sessions(&self, device_id: &str) -> Vec<Session> {
        self.list_sessions()
            .await
            .into_iter()
            .filter(|s| s.device_id == device_id)
            .collect()
    }

    pub async fn user_sessions(&self, user_id: &str) -> Vec<Session> {
        self.list_sessions()
            .await
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect()
    }

    pub async fn device_reservations(&self, device_id: &str) -> Vec<Reservation> {
        let reservations = self.reservations.read().await;
        reservations
            .values()
            .filter(|r| r.device_id == device_id && r.status == ReservationStatus::Active)
            .cloned()
            .collect()
    }

    pub async fn list_reservations(&self, status: Option<ReservationStatus>) -> Vec<Reservation> {
        let reservations = self.reservations.read().await;
        let mut list: Vec<Reservation> = reservations
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        list
    }

    pub async fn active_session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    /// Aggregate counters for the stats and analytics queries
    pub async fn stats(&self) -> LabStats {
        let devices = self.registry.list().await;
        let mut devices_by_status: HashMap<String, usize> = HashMap::new();
        let mut devices_by_platform: HashMap<String, usize> = HashMap::new();
        for device in &devices {
            *devices_by_status
                .entry(device.status.to_string())
                .or_insert(0) += 1;
            *devices_by_platform
                .entry(device.platform.to_string())
                .or_insert(0) += 1;
        }

        let reservations = self.reservations.read().await;
        let sessions = self.sessions.read().await;
        let mut sessions_by_hour: HashMap<String, usize> = HashMap::new();
        for session in sessions.values() {
            let bucket = session.start_time.format("%Y-%m-%dT%H:00").to_string();
            *sessions_by_hour.entry(bucket).or_insert(0) += 1;
        }

        LabStats {
            total_devices: devices.len(),
            devices_by_status,
            devices_by_platform,
            total_reservations: reservations.len(),
            active_reservations: reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Active)
                .count(),
            total_sessions: sessions.len(),
            active_sessions: sessions
                .values()
                .filter(|s| s.status == SessionStatus::Active)
                .count(),
            sessions_by_hour,
        }
    }

    /// Spawn the deadline reaper when enabled; returns its task handle
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.reaper_enabled {
            return None;
        }
        let manager = self.clone();
        let interval = std::time::Duration::from_secs(self.config.reaper_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.reap_expired().await;
            }
        }))
    }

    /// Release every reservation whose deadline has passed
    pub async fn reap_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let reservations = self.reservations.read().await;
            reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Active && r.end_time <= now)
                .map(|r| r.device_id.clone())
                .collect()
        };
        for device_id in expired {
            info!("Reservation deadline passed for {}; releasing", device_id);
            if let Err(e) = self.release(&device_id).await {
                warn!("Deadline release failed for {}: {}", device_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::DriverSupervisor;
    use chrono::Utc;
    use devicelab_common::{
        Device, DeviceCapabilities, DeviceKind, DeviceStatus, DriverConfig, NullSink, Orientation,
        Platform,
    };

    async fn fixture() -> (Arc<DeviceRegistry>, Arc<SessionManager>, String) {
        let supervisor = Arc::new(DriverSupervisor::new(
            DriverConfig::default(),
            Arc::new(NullSink),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            Vec::new(),
            supervisor,
            Arc::new(NullSink),
        ));
        let device = Device {
            id: "d-1".to_string(),
            serial: "serial-1".to_string(),
            platform: Platform::Android,
            kind: DeviceKind::Physical,
            name: "Test".to_string(),
            model: "Test".to_string(),
            manufacturer: "Acme".to_string(),
            os_version: "14".to_string(),
            api_level: Some(34),
            resolution: None,
            orientation: Orientation::Portrait,
            capabilities: DeviceCapabilities::default(),
            properties: Default::default(),
            status: DeviceStatus::Online,
            battery: 85,
            reserved_by: None,
            reserved_at: None,
            connected_at: Utc::now(),
            last_seen: Utc::now(),
        };
        registry.insert(device).await;
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            registry.clone(),
            Arc::new(NullSink),
        ));
        (registry, manager, "d-1".to_string())
    }

    #[tokio::test]
    async fn test_reserve_sets_deadline_and_status() {
        let (registry, manager, id) = fixture().await;
        let reservation = manager
            .reserve(&id, "alice", Some(120), Some("wdio".to_string()))
            .await
            .unwrap();

        assert_eq!(reservation.status, ReservationStatus::Active);
        let minutes = (reservation.end_time - reservation.start_time).num_minutes();
        assert_eq!(minutes, 120);

        let device = registry.get(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Reserved);
        assert_eq!(device.reserved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_reserve_validates_user() {
        let (_registry, manager, id) = fixture().await;
        let err = manager.reserve(&id, "  ", None, None).await.unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn test_at_most_one_active_reservation() {
        let (_registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();
        assert!(manager.reserve(&id, "bob", None, None).await.is_err());

        let active: Vec<_> = manager.device_reservations(&id).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_release_completes_reservation() {
        let (_registry, manager, id) = fixture().await;
        let reservation = manager.reserve(&id, "alice", None, None).await.unwrap();

        let device = manager.release(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(device.reserved_by.is_none());

        let all = manager.list_reservations(None).await;
        let completed = all.iter().find(|r| r.id == reservation.id).unwrap();
        assert_eq!(completed.status, ReservationStatus::Completed);
        assert!(manager.active_reservation(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_release_without_reservation_still_onlines() {
        let (registry, manager, id) = fixture().await;
        let device = manager.release(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        let device = registry.get(&id).await.unwrap();
        assert!(device.reserved_by.is_none());
    }

    #[tokio::test]
    async fn test_session_within_reservation() {
        let (registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();

        let session = manager.create_session(&id, "alice").await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(registry.get(&id).await.unwrap().status, DeviceStatus::InUse);

        // the reservation remains active while the session runs
        assert!(manager.active_reservation(&id).await.is_some());

        let ended = manager.end_session(&session.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(ended.end_time.is_some());
        // reservation still holds: back to reserved
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            DeviceStatus::Reserved
        );
    }

    #[tokio::test]
    async fn test_session_requires_reservation() {
        let (registry, manager, id) = fixture().await;

        // session start on an unreserved device is rejected without mutation
        let err = manager.create_session(&id, "bob").await.unwrap_err();
        assert!(matches!(err, LabError::InvalidState(_)));
        let device = registry.get(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(manager.active_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_at_most_one_active_session() {
        let (_registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();
        manager.create_session(&id, "alice").await.unwrap();
        let err = manager.create_session(&id, "bob").await.unwrap_err();
        assert!(matches!(err, LabError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_end_session_twice_rejected() {
        let (_registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();
        let session = manager.create_session(&id, "alice").await.unwrap();
        manager.end_session(&session.id).await.unwrap();
        assert!(manager.end_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_session_queries() {
        let (_registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();
        let session = manager.create_session(&id, "alice").await.unwrap();

        assert_eq!(manager.device_sessions(&id).await.len(), 1);
        assert_eq!(manager.user_sessions("alice").await.len(), 1);
        assert!(manager.user_sessions("bob").await.is_empty());
        assert_eq!(manager.get_session(&session.id).await.unwrap().id, session.id);
        assert!(manager.get_session("missing").await.is_err());
        assert_eq!(manager.active_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let (_registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", None, None).await.unwrap();
        manager.create_session(&id, "alice").await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.total_devices, 1);
        assert_eq!(stats.active_reservations, 1);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.devices_by_platform.get("android"), Some(&1));
        assert_eq!(stats.sessions_by_hour.values().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_reaper_releases_expired() {
        let (registry, manager, id) = fixture().await;
        manager.reserve(&id, "alice", Some(0), None).await.unwrap();

        manager.reap_expired().await;
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            DeviceStatus::Online
        );
        assert!(manager.active_reservation(&id).await.is_none());
    }
}
