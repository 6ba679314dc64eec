//! Realtime hub
//!
//! Fan-out/fan-in broker between subscribers and the rest of the lab. The
//! [`EventHub`] owns the subscriber set and implements the broadcast sink
//! that every other component publishes through; the [`RequestRouter`]
//! accepts connections on the framed transport, pushes the device-list
//! snapshot on connect, routes inbound requests, and dispatches control
//! commands to the platform adapters.

use crate::{
    mirror::MirrorPumps, registry::DeviceRegistry, sessions::SessionManager,
    supervisor::DriverSupervisor,
};
use async_trait::async_trait;
use devicelab_common::net::{read_message, write_message};
use devicelab_common::{
    CommandPayload, CommandRecord, CommandStatus, Device, Envelope, Event, EventSink,
    HealthSnapshot, LabError, OriginAllowlist, Request, RequestFrame, Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outbound channel depth per subscriber
const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

struct SubscriberHandle {
    sender: mpsc::Sender<Event>,
    /// device this subscriber currently mirrors, at most one
    mirroring: Option<String>,
}

/// Subscriber set plus broadcast fan-out; the sink the other components see
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<HashMap<String, SubscriberHandle>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, subscriber_id: &str, sender: mpsc::Sender<Event>) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            subscriber_id.to_string(),
            SubscriberHandle {
                sender,
                mirroring: None,
            },
        );
        info!("Subscriber {} connected ({} total)", subscriber_id, subscribers.len());
    }

    pub async fn unregister(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(subscriber_id);
        info!("Subscriber {} disconnected ({} left)", subscriber_id, subscribers.len());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn sender_of(&self, subscriber_id: &str) -> Option<mpsc::Sender<Event>> {
        let subscribers = self.subscribers.read().await;
        subscribers.get(subscriber_id).map(|h| h.sender.clone())
    }

    /// Record the device a subscriber mirrors; returns the previous binding
    pub async fn set_mirroring(
        &self,
        subscriber_id: &str,
        device_id: Option<String>,
    ) -> Option<String> {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.get_mut(subscriber_id) {
            Some(handle) => std::mem::replace(&mut handle.mirroring, device_id),
            None => None,
        }
    }

    pub async fn mirroring(&self, subscriber_id: &str) -> Option<String> {
        let subscribers = self.subscribers.read().await;
        subscribers.get(subscriber_id).and_then(|h| h.mirroring.clone())
    }
}

#[async_trait]
impl EventSink for EventHub {
    async fn publish(&self, event: Event) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, handle) in subscribers.iter() {
                // a saturated subscriber drops broadcast events rather than
                // stalling the fan-out for everyone else
                match handle.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Subscriber {} is saturated; dropping broadcast", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id.clone()),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

/// Routes inbound requests to the registry, session manager, supervisor,
/// and mirror pumps; constructed last, after all the components it fronts
pub struct RequestRouter {
    hub: Arc<EventHub>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    supervisor: Arc<DriverSupervisor>,
    pumps: Arc<MirrorPumps>,
    host: String,
    started_at: Instant,
}

impl RequestRouter {
    pub fn new(
        hub: Arc<EventHub>,
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionManager>,
        supervisor: Arc<DriverSupervisor>,
        pumps: Arc<MirrorPumps>,
        host: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            registry,
            sessions,
            supervisor,
            pumps,
            host,
            started_at: Instant::now(),
        })
    }

    /// Accept loop for the framed transport
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        allowlist: OriginAllowlist,
        rate_limit: u32,
    ) -> Result<()> {
        info!("Realtime channel listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| LabError::network(format!("accept failed: {}", e)))?;
            if !allowlist.is_allowed(peer.ip()) {
                warn!("Connection from {} rejected: not in allow-list", peer);
                continue;
            }
            let router = self.clone();
            tokio::spawn(router.handle_connection(stream, peer, rate_limit));
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, rate_limit: u32) {
        let subscriber_id = uuid::Uuid::new_v4().to_string();
        debug!("Connection {} from {}", subscriber_id, peer);

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Event>(SUBSCRIBER_CHANNEL_DEPTH);

        let writer_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &event).await {
                    debug!("Subscriber write failed: {}", e);
                    break;
                }
            }
        });

        self.hub.register(&subscriber_id, tx.clone()).await;

        // connect-time snapshot of the device list
        let snapshot = Event::device_list(self.registry.list().await);
        if tx.send(snapshot).await.is_err() {
            self.cleanup_subscriber(&subscriber_id).await;
            writer_task.abort();
            return;
        }

        let mut window_start = Instant::now();
        let mut window_count: u32 = 0;
        loop {
            let frame: RequestFrame = match read_message(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Subscriber {} read ended: {}", subscriber_id, e);
                    break;
                }
            };

            if window_start.elapsed().as_secs() >= 60 {
                window_start = Instant::now();
                window_count = 0;
            }
            window_count += 1;
            let response = if window_count > rate_limit {
                Event::response(
                    frame.id,
                    Envelope::fail(&LabError::resource_exhaustion("request rate limit exceeded")),
                )
            } else {
                // requests from one subscriber are processed in receive order
                self.handle(&subscriber_id, frame).await
            };
            if tx.send(response).await.is_err() {
                break;
            }
        }

        self.cleanup_subscriber(&subscriber_id).await;
        writer_task.abort();
    }

    async fn cleanup_subscriber(&self, subscriber_id: &str) {
        // any active mirror stops with the connection
        self.pumps.drop_subscriber(subscriber_id).await;
        self.hub.unregister(subscriber_id).await;
    }

    /// Handle one framed request, producing its correlated response event
    pub async fn handle(&self, subscriber_id: &str, frame: RequestFrame) -> Event {
        let envelope = self.dispatch(subscriber_id, frame.request).await;
        Event::response(frame.id, envelope)
    }

    async fn dispatch(&self, subscriber_id: &str, request: Request) -> Envelope {
        match request {
            Request::ListDevices => Envelope::ok(&self.registry.list().await),
            Request::GetDevice { device_id } => {
                Envelope::from_result(self.registry.get(&device_id).await)
            }
            Request::RefreshDevices => Envelope::ok(&self.registry.discovery_cycle().await),
            Request::Reserve {
                device_id,
                user_id,
                duration_minutes,
                purpose,
            } => Envelope::from_result(
                self.sessions
                    .reserve(&device_id, &user_id, duration_minutes, purpose)
                    .await,
            ),
            Request::Release { device_id } => {
                self.supervisor.stop(&device_id).await;
                Envelope::from_result(self.sessions.release(&device_id).await)
            }
            Request::StartSession { device_id, user_id } => {
                Envelope::from_result(self.sessions.create_session(&device_id, &user_id).await)
            }
            Request::EndSession { session_id } => {
                Envelope::from_result(self.sessions.end_session(&session_id).await)
            }
            Request::Command { device_id, payload } => {
                self.execute_command(subscriber_id, &device_id, payload).await
            }
            Request::InstallApp { device_id, path } => {
                let payload = CommandPayload::Install { path };
                self.execute_command(subscriber_id, &device_id, payload).await
            }
            Request::ListSessions => Envelope::ok(&self.sessions.list_sessions().await),
            Request::GetSession { session_id } => {
                Envelope::from_result(self.sessions.get_session(&session_id).await)
            }
            Request::DeviceSessions { device_id } => {
                Envelope::ok(&self.sessions.device_sessions(&device_id).await)
            }
            Request::UserSessions { user_id } => {
                Envelope::ok(&self.sessions.user_sessions(&user_id).await)
            }
            Request::DeviceReservations { device_id } => {
                Envelope::ok(&self.sessions.device_reservations(&device_id).await)
            }
            Request::ListReservations { status } => {
                Envelope::ok(&self.sessions.list_reservations(status).await)
            }
            Request::Health => Envelope::ok(&self.health().await),
            Request::Stats => Envelope::ok(&self.sessions.stats().await),
            Request::StartDriver { device_id } => {
                Envelope::from_result(self.start_driver(&device_id).await)
            }
            Request::StopDriver { device_id } => {
                Envelope::from_result(self.stop_driver(&device_id).await)
            }
            Request::DriverStatus { device_id } => {
                match self.supervisor.status(&device_id).await {
                    Some(info) => Envelope::ok(&json!({
                        "deviceId": info.device_id,
                        "status": info.status,
                        "port": info.port,
                        "url": info.endpoint(&self.host),
                        "startedAt": info.started_at,
                    })),
                    None => Envelope::ok(&json!({ "deviceId": device_id, "running": false })),
                }
            }
            Request::DriverLogs { device_id } => {
                Envelope::from_result(self.supervisor.logs(&device_id).await)
            }
            Request::ClearDriverLogs { device_id } => match self
                .supervisor
                .clear_logs(&device_id)
                .await
            {
                Ok(()) => Envelope::ok_message("driver logs cleared"),
                Err(e) => Envelope::fail(&e),
            },
            Request::AutoStart {
                device_id,
                user_id,
                duration_minutes,
                purpose,
            } => Envelope::from_result(
                self.auto_start(&device_id, user_id, duration_minutes, purpose)
                    .await,
            ),
            Request::ListDrivers => {
                let servers = self.supervisor.list().await;
                let with_urls: Vec<serde_json::Value> = servers
                    .iter()
                    .map(|info| {
                        json!({
                            "deviceId": info.device_id,
                            "status": info.status,
                            "port": info.port,
                            "url": info.endpoint(&self.host),
                            "startedAt": info.started_at,
                        })
                    })
                    .collect();
                Envelope::ok(&with_urls)
            }
            Request::Analytics => Envelope::ok(&self.sessions.stats().await),
            Request::AnalyticsDevices => {
                let stats = self.sessions.stats().await;
                Envelope::ok(&json!({
                    "byStatus": stats.devices_by_status,
                    "byPlatform": stats.devices_by_platform,
                }))
            }
            Request::AnalyticsHourly => {
                let stats = self.sessions.stats().await;
                Envelope::ok(&stats.sessions_by_hour)
            }
            Request::StartMirror { device_id, fps } => {
                Envelope::from_result(self.start_mirror(subscriber_id, &device_id, fps).await)
            }
            Request::StopMirror { device_id } => {
                self.pumps.stop_mirror(subscriber_id, &device_id).await;
                if self.hub.mirroring(subscriber_id).await.as_deref() == Some(device_id.as_str()) {
                    self.hub.set_mirroring(subscriber_id, None).await;
                }
                Envelope::ok_message("mirror stopped")
            }
        }
    }

    /// Synthesize a command record, validate, invoke the adapter, and reply
    async fn execute_command(
        &self,
        subscriber_id: &str,
        device_id: &str,
        payload: CommandPayload,
    ) -> Envelope {
        let mut record = CommandRecord::new(device_id.to_string(), payload);
        if let Err(e) = record.payload.validate() {
            record.status = CommandStatus::Failed;
            record.error = Some(e.to_string());
            return Envelope::fail(&e);
        }

        let device = match self.registry.get(device_id).await {
            Ok(device) => device,
            Err(e) => return Envelope::fail(&e),
        };
        let adapter = match self.registry.adapter_for(device.platform) {
            Some(adapter) => adapter,
            None => {
                return Envelope::fail(&LabError::server(format!(
                    "no adapter for {}",
                    device.platform
                )))
            }
        };

        // unsupported (kind, platform) pairs fail before the adapter is invoked
        let kind = record.payload.kind();
        if !adapter.supports(kind) {
            let err = LabError::unsupported(format!(
                "{} is not supported for {} devices",
                kind,
                device.platform.label()
            ));
            record.status = CommandStatus::Failed;
            record.error = Some(err.to_string());
            self.notify_command_error(subscriber_id, &record).await;
            return Envelope::fail(&err);
        }

        record.status = CommandStatus::Executing;
        let serial = device.serial.as_str();
        let outcome: Result<Option<String>> = match &record.payload {
            CommandPayload::Tap { x, y } => adapter.tap(serial, *x, *y).await.map(|_| None),
            CommandPayload::Swipe { x1, y1, x2, y2, duration_ms } => adapter
                .swipe(serial, (*x1, *y1), (*x2, *y2), *duration_ms)
                .await
                .map(|_| None),
            CommandPayload::Drag { x1, y1, x2, y2, duration_ms } => adapter
                .drag(serial, (*x1, *y1), (*x2, *y2), *duration_ms)
                .await
                .map(|_| None),
            CommandPayload::Key { keycode } => {
                adapter.key_event(serial, *keycode).await.map(|_| None)
            }
            CommandPayload::Text { text } => adapter.input_text(serial, text).await.map(|_| None),
            CommandPayload::Install { path } => adapter
                .install_app(serial, std::path::Path::new(path))
                .await
                .map(|_| None),
            CommandPayload::Uninstall { package } => {
                adapter.uninstall_app(serial, package).await.map(|_| None)
            }
            CommandPayload::Shell { command } => adapter.shell(serial, command).await.map(Some),
        };

        match outcome {
            Ok(result) => {
                record.status = CommandStatus::Completed;
                record.result = result;
                Envelope::ok(&json!({
                    "commandId": record.id,
                    "success": true,
                    "result": record.result,
                }))
            }
            Err(e) => {
                record.status = CommandStatus::Failed;
                record.error = Some(e.to_string());
                self.notify_command_error(subscriber_id, &record).await;
                Envelope::fail(&e)
            }
        }
    }

    async fn notify_command_error(&self, subscriber_id: &str, record: &CommandRecord) {
        if let Some(sender) = self.hub.sender_of(subscriber_id).await {
            let message = record.error.clone().unwrap_or_else(|| "command failed".into());
            let _ = sender
                .send(Event::error(message, Some(record.id.clone())))
                .await;
        }
    }

    async fn start_driver(&self, device_id: &str) -> Result<serde_json::Value> {
        let device = self.registry.get(device_id).await?;
        if !device.is_held() {
            return Err(LabError::invalid_state(format!(
                "device must be reserved or in use to start a driver (status is {})",
                device.status
            )));
        }
        let port = self.supervisor.start(&device).await?;
        Ok(json!({
            "deviceId": device_id,
            "port": port,
            "url": format!("http://{}:{}/wd/hub", self.host, port),
        }))
    }

    async fn stop_driver(&self, device_id: &str) -> Result<Device> {
        self.supervisor.stop(device_id).await;
        if let Some(session) = self.sessions.active_session(device_id).await {
            self.sessions.end_session(&session.id).await?;
        }
        self.sessions.release(device_id).await
    }

    /// Reserve, start the driver, and open a session in one call
    async fn auto_start(
        &self,
        device_id: &str,
        user_id: Option<String>,
        duration_minutes: Option<u64>,
        purpose: Option<String>,
    ) -> Result<serde_json::Value> {
        let user = user_id.unwrap_or_else(|| "automation".to_string());
        let device = self.registry.get(device_id).await?;

        let reservation = if device.is_reservable() {
            Some(
                self.sessions
                    .reserve(device_id, &user, duration_minutes, purpose)
                    .await?,
            )
        } else if device.is_held() && device.reserved_by.as_deref() == Some(user.as_str()) {
            self.sessions.active_reservation(device_id).await
        } else {
            return Err(LabError::invalid_state(format!(
                "device not available: status is {}",
                device.status
            )));
        };

        let device = self.registry.get(device_id).await?;
        let port = match self.supervisor.start(&device).await {
            Ok(port) => port,
            Err(e) => {
                // roll the reservation back rather than stranding the device
                let _ = self.sessions.release(device_id).await;
                return Err(e);
            }
        };

        let session = match self.sessions.active_session(device_id).await {
            Some(session) => session,
            None => self.sessions.create_session(device_id, &user).await?,
        };

        Ok(json!({
            "reservation": reservation,
            "session": session,
            "port": port,
            "url": format!("http://{}:{}/wd/hub", self.host, port),
            "capabilities": crate::supervisor::DriverSupervisor::capabilities_for(&device),
        }))
    }

    pub async fn health(&self) -> HealthSnapshot {
        let counts = self.registry.count_by_status().await;
        use devicelab_common::DeviceStatus::*;
        HealthSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            total_devices: counts.values().sum(),
            online_devices: *counts.get(&Online).unwrap_or(&0),
            offline_devices: *counts.get(&Offline).unwrap_or(&0),
            reserved_devices: *counts.get(&Reserved).unwrap_or(&0),
            in_use_devices: *counts.get(&InUse).unwrap_or(&0),
            active_sessions: self.sessions.active_session_count().await,
            running_drivers: self.supervisor.running_count().await,
            subscribers: self.hub.subscriber_count().await,
        }
    }

    async fn start_mirror(
        &self,
        subscriber_id: &str,
        device_id: &str,
        fps: Option<u32>,
    ) -> Result<serde_json::Value> {
        let device = self.registry.get(device_id).await?;
        let sender = self
            .hub
            .sender_of(subscriber_id)
            .await
            .ok_or_else(|| LabError::server("subscriber is not registered"))?;

        match self.hub.mirroring(subscriber_id).await {
            // same device: confirm and reuse
            Some(current) if current == device_id => {}
            // different device: stop the previous mirror first
            Some(previous) => {
                self.pumps.stop_mirror(subscriber_id, &previous).await;
            }
            None => {}
        }

        let effective_fps = self
            .pumps
            .start_mirror(subscriber_id, &device, fps, sender)
            .await?;
        self.hub
            .set_mirroring(subscriber_id, Some(device_id.to_string()))
            .await;
        Ok(json!({ "deviceId": device_id, "fps": effective_fps }))
    }
}
