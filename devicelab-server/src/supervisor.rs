//! Driver-server supervisor
//!
//! Owns a pool of child processes, one per device, each exposing a remote
//! automation endpoint. Allocates ports from a bounded range, launches the
//! driver with device-specific default capabilities, parses its output into
//! a filtered ring, watches for the ready sentinel, supervises exit, and
//! tears servers down on demand or when a device disappears.

use chrono::Utc;
use devicelab_common::{
    Device, DriverConfig, DriverLogFilter, DriverServerInfo, DriverStatus, Event, EventSink,
    LabError, LogEntry, LogLevel, LogRing, Platform, Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Substring in driver stdout marking successful startup. The Android
/// driver prints "Appium REST http interface listener started on ...";
/// matching on the suffix tolerates both driver banners.
const READY_SENTINEL: &str = "REST http interface listener started";

/// Poll interval while waiting for the ready sentinel
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed operational capabilities applied to every driver launch
const COMMAND_TIMEOUT_SECS: u64 = 300;

struct DriverServer {
    info: DriverServerInfo,
    status: Arc<RwLock<DriverStatus>>,
    ring: Arc<LogRing>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Supervisor for per-device driver-server child processes
pub struct DriverSupervisor {
    config: DriverConfig,
    servers: Arc<Mutex<HashMap<String, DriverServer>>>,
    filter: Arc<DriverLogFilter>,
    sink: Arc<dyn EventSink>,
}

impl DriverSupervisor {
    pub fn new(config: DriverConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            servers: Arc::new(Mutex::new(HashMap::new())),
            filter: Arc::new(DriverLogFilter::new()),
            sink,
        }
    }

    /// Best-effort kill of lingering driver instances from earlier runs.
    /// Fire-and-forget: must never block startup.
    pub fn cleanup_orphans(&self) {
        let binary = self.config.binary.clone();
        tokio::spawn(async move {
            match Command::new("pkill").args(["-f", &binary]).status().await {
                Ok(status) => debug!("Orphan cleanup for {} exited with {}", binary, status),
                Err(e) => debug!("Orphan cleanup unavailable: {}", e),
            }
        });
    }

    /// Allocate a free port by probing the configured range with a bind.
    /// Called with the pool guard held so concurrent starts cannot claim
    /// the same port.
    async fn allocate_port(&self, servers: &HashMap<String, DriverServer>) -> Result<u16> {
        let in_use: Vec<u16> = servers.values().map(|s| s.info.port).collect();

        let base = self.config.base_port;
        for offset in 0..self.config.port_range {
            let candidate = base + offset;
            if in_use.contains(&candidate) {
                continue;
            }
            match TcpListener::bind(("127.0.0.1", candidate)).await {
                Ok(listener) => {
                    drop(listener);
                    return Ok(candidate);
                }
                Err(_) => continue,
            }
        }
        Err(LabError::resource_exhaustion("no available ports"))
    }

    /// Default-capabilities blob derived from the device record
    pub fn capabilities_for(device: &Device) -> serde_json::Value {
        let (platform_name, automation_name) = match device.platform {
            Platform::Android => ("Android", "UiAutomator2"),
            Platform::Ios => ("iOS", "XCUITest"),
        };
        json!({
            "platformName": platform_name,
            "appium:automationName": automation_name,
            "appium:platformVersion": device.os_version,
            "appium:udid": device.serial,
            "appium:deviceName": device.name,
            "appium:newCommandTimeout": COMMAND_TIMEOUT_SECS,
            "appium:noReset": true,
        })
    }

    /// Start a driver server for the device, returning its port.
    ///
    /// Idempotent: a server already in `running` state short-circuits to its
    /// port. Otherwise the call returns once the ready sentinel is observed,
    /// or fails after the configured start timeout.
    pub async fn start(&self, device: &Device) -> Result<u16> {
        let status_handle = {
            let servers = self.servers.lock().await;
            if let Some(server) = servers.get(&device.id) {
                let status = *server.status.read().await;
                match status {
                    DriverStatus::Running => return Ok(server.info.port),
                    DriverStatus::Starting => Some(server.status.clone()),
                    _ => None,
                }
            } else {
                None
            }
        };

        // another caller is mid-start: wait on its record instead of
        // spawning a second child
        if let Some(status) = status_handle {
            return self.wait_for_ready(&device.id, status).await;
        }

        let status = Arc::new(RwLock::new(DriverStatus::Starting));
        let ring = Arc::new(LogRing::new(self.config.log_capacity));

        // allocate and claim the port in one pool-lock scope so concurrent
        // starts cannot pick the same candidate
        let port = {
            let mut servers = self.servers.lock().await;
            let port = self.allocate_port(&servers).await?;
            servers.insert(
                device.id.clone(),
                DriverServer {
                    info: DriverServerInfo {
                        device_id: device.id.clone(),
                        port,
                        status: DriverStatus::Starting,
                        started_at: Utc::now(),
                    },
                    status: status.clone(),
                    ring: ring.clone(),
                    kill_tx: None,
                },
            );
            port
        };

        let capabilities = Self::capabilities_for(device);
        let capabilities_arg = capabilities.to_string();
        let port_arg = port.to_string();

        info!("Starting driver server for {} on port {}", device.id, port);
        let spawn_result = Command::new(&self.config.binary)
            .args([
                "--port",
                &port_arg,
                "--session-override",
                "--log-level",
                "error:debug",
                "--default-capabilities",
                &capabilities_arg,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.servers.lock().await.remove(&device.id);
                return Err(LabError::resource_exhaustion(format!(
                    "failed to spawn {} for {}: {}",
                    self.config.binary, device.id, e
                )));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        // hand the kill switch to the record; if a concurrent stop already
        // removed it, dropping the sender makes the exit watcher kill the
        // child immediately
        {
            let mut servers = self.servers.lock().await;
            if let Some(server) = servers.get_mut(&device.id) {
                server.kill_tx = Some(kill_tx);
            }
        }

        self.publish_system_log(
            LogLevel::Info,
            format!("driver server starting for {} on port {}", device.id, port),
        )
        .await;

        if let Some(stdout) = stdout {
            self.spawn_output_reader(device.id.clone(), stdout, ring.clone(), Some(status.clone()));
        }
        if let Some(stderr) = stderr {
            self.spawn_output_reader(device.id.clone(), stderr, ring.clone(), None);
        }

        self.spawn_exit_watcher(device.id.clone(), child, status.clone(), kill_rx);

        match self.wait_for_ready(&device.id, status).await {
            Ok(port) => Ok(port),
            Err(e) => {
                // partially-started record must not linger; the child (if
                // still alive) is killed and orphan cleanup is the backstop
                self.stop(&device.id).await;
                Err(e)
            }
        }
    }

    async fn wait_for_ready(
        &self,
        device_id: &str,
        status: Arc<RwLock<DriverStatus>>,
    ) -> Result<u16> {
        let deadline = Instant::now() + Duration::from_secs(self.config.start_timeout_secs);
        loop {
            match *status.read().await {
                DriverStatus::Running => {
                    let servers = self.servers.lock().await;
                    return servers
                        .get(device_id)
                        .map(|s| s.info.port)
                        .ok_or_else(|| LabError::server("driver server vanished after start"));
                }
                DriverStatus::Error | DriverStatus::Stopped => {
                    return Err(LabError::tool(format!(
                        "driver server for {} failed to start",
                        device_id
                    )));
                }
                DriverStatus::Starting => {}
            }
            if Instant::now() >= deadline {
                return Err(LabError::timeout(format!(
                    "driver server for {} did not become ready within {}s",
                    device_id, self.config.start_timeout_secs
                )));
            }
            sleep(START_POLL_INTERVAL).await;
        }
    }

    fn spawn_output_reader<R>(
        &self,
        device_id: String,
        pipe: R,
        ring: Arc<LogRing>,
        watch_ready: Option<Arc<RwLock<DriverStatus>>>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let filter = self.filter.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(status) = &watch_ready {
                    if line.contains(READY_SENTINEL) {
                        let mut guard = status.write().await;
                        if *guard == DriverStatus::Starting {
                            *guard = DriverStatus::Running;
                            info!("Driver server for {} is ready", device_id);
                            sink.publish(Event::device_log(LogEntry::system(
                                LogLevel::Info,
                                "driver",
                                format!("driver server for {} is running", device_id),
                            )))
                            .await;
                        }
                    }
                }
                if let Some(kept) = filter.apply(&line) {
                    ring.push_line(&device_id, LogLevel::Info, "driver", kept);
                }
            }
            debug!("Output reader for {} finished", device_id);
        });
    }

    fn spawn_exit_watcher(
        &self,
        device_id: String,
        mut child: tokio::process::Child,
        status: Arc<RwLock<DriverStatus>>,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let servers = self.servers.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = child.wait() => exit,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!("Driver child for {} already gone: {}", device_id, e);
                    }
                    child.wait().await
                }
            };

            let final_status = match exit {
                Ok(code) if code.success() => DriverStatus::Stopped,
                Ok(code) => {
                    warn!("Driver server for {} exited with {}", device_id, code);
                    DriverStatus::Error
                }
                Err(e) => {
                    error!("Failed to reap driver server for {}: {}", device_id, e);
                    DriverStatus::Error
                }
            };
            *status.write().await = final_status;

            // the record leaves the pool on exit, whatever the cause
            servers.lock().await.remove(&device_id);
            sink.publish(Event::device_log(LogEntry::system(
                if final_status == DriverStatus::Error {
                    LogLevel::Error
                } else {
                    LogLevel::Info
                },
                "driver",
                format!("driver server for {} exited ({:?})", device_id, final_status),
            )))
            .await;
        });
    }

    /// Stop the driver server for a device; legal in any status
    pub async fn stop(&self, device_id: &str) {
        let kill_tx = {
            let mut servers = self.servers.lock().await;
            servers
                .remove(device_id)
                .and_then(|mut server| server.kill_tx.take())
        };
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
            info!("Stopped driver server for {}", device_id);
            self.publish_system_log(
                LogLevel::Info,
                format!("driver server for {} stopped", device_id),
            )
            .await;
        }
    }

    /// Stop every supervised server, terminations issued in parallel
    pub async fn stop_all(&self) {
        let device_ids: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.keys().cloned().collect()
        };
        let stops = device_ids.iter().map(|id| self.stop(id));
        futures::future::join_all(stops).await;
        info!("All driver servers stopped");
    }

    /// Snapshot of one server, if present
    pub async fn status(&self, device_id: &str) -> Option<DriverServerInfo> {
        let servers = self.servers.lock().await;
        let server = servers.get(device_id)?;
        let mut info = server.info.clone();
        info.status = *server.status.read().await;
        Some(info)
    }

    /// Snapshot of every supervised server
    pub async fn list(&self) -> Vec<DriverServerInfo> {
        let servers = self.servers.lock().await;
        let mut out = Vec::with_capacity(servers.len());
        for server in servers.values() {
            let mut info = server.info.clone();
            info.status = *server.status.read().await;
            out.push(info);
        }
        out
    }

    /// Snapshot copy of a server's filtered log ring
    pub async fn logs(&self, device_id: &str) -> Result<Vec<LogEntry>> {
        let servers = self.servers.lock().await;
        servers
            .get(device_id)
            .map(|s| s.ring.snapshot())
            .ok_or_else(|| LabError::not_found("driver server", device_id))
    }

    /// Empty a server's log ring
    pub async fn clear_logs(&self, device_id: &str) -> Result<()> {
        let servers = self.servers.lock().await;
        servers
            .get(device_id)
            .map(|s| s.ring.clear())
            .ok_or_else(|| LabError::not_found("driver server", device_id))
    }

    pub async fn running_count(&self) -> usize {
        let servers = self.servers.lock().await;
        let mut count = 0;
        for server in servers.values() {
            if *server.status.read().await == DriverStatus::Running {
                count += 1;
            }
        }
        count
    }

    async fn publish_system_log(&self, level: LogLevel, message: String) {
        self.sink
            .publish(Event::device_log(LogEntry::system(level, "driver", message)))
            .await;
    }
}
