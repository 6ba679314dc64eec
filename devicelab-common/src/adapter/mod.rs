//! Platform adapters
//!
//! Each adapter exposes a uniform capability surface over one device
//! backend; callers never branch on platform except at this boundary.
//! Adapters are stateless aside from small caches (device-kind
//! classification, pixel-to-point scale factors on iOS).

pub mod android;
pub mod ios;

use crate::{
    CommandKind, DeviceCapabilities, DeviceKind, LabError, LogEntry, Orientation, Platform, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

pub use android::AndroidAdapter;
pub use ios::IosAdapter;

/// A vendor identifier observed during a discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub serial: String,
    pub kind: DeviceKind,
}

/// Everything an adapter learns about a device during enrichment
#[derive(Debug, Clone)]
pub struct DeviceFacts {
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
    pub battery: u8,
}

/// Per-line callback invoked by a log tail
pub type LogSink = Box<dyn Fn(LogEntry) + Send + Sync>;

/// Handle for a running log tail; dropping it leaves the tail running,
/// `stop` terminates the child and closes its pipes
pub struct LogTailHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LogTailHandle {
    pub fn new(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { stop_tx, task }
    }

    /// Terminate the tail child process and its reader task
    pub fn stop(self) {
        // the reader task kills the child when it observes the signal;
        // abort is the backstop if it is wedged on a pipe read
        if self.stop_tx.send(()).is_err() {
            self.task.abort();
        }
    }
}

/// Uniform capability surface over one platform backend
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Enumerate currently visible vendor identifiers
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Query properties, battery, resolution, and orientation for one device
    async fn facts(&self, serial: &str) -> Result<DeviceFacts>;

    /// Battery level 0-100
    async fn battery(&self, serial: &str) -> Result<u8>;

    /// Capture a PNG screenshot
    async fn screenshot(&self, serial: &str) -> Result<Vec<u8>>;

    async fn tap(&self, serial: &str, x: u32, y: u32) -> Result<()>;

    async fn swipe(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()>;

    async fn drag(
        &self,
        serial: &str,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: Option<u64>,
    ) -> Result<()>;

    async fn key_event(&self, serial: &str, keycode: u32) -> Result<()>;

    async fn input_text(&self, serial: &str, text: &str) -> Result<()>;

    async fn install_app(&self, serial: &str, path: &Path) -> Result<()>;

    async fn uninstall_app(&self, serial: &str, package: &str) -> Result<()>;

    /// Execute a shell command on the device (Android only)
    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let _ = command;
        Err(LabError::unsupported(format!(
            "shell is not supported for {} devices ({})",
            self.platform(),
            serial
        )))
    }

    /// Stream device logs into the sink (Android only); returns a stop handle
    async fn tail_logs(&self, serial: &str, device_id: &str, sink: LogSink) -> Result<LogTailHandle> {
        let _ = (device_id, sink);
        Err(LabError::unsupported(format!(
            "log tailing is not supported for {} devices ({})",
            self.platform(),
            serial
        )))
    }

    /// Whether this platform implements the given command kind at all
    fn supports(&self, kind: CommandKind) -> bool;

    /// Drop any cached per-device state (called on disconnect)
    fn invalidate(&self, serial: &str) {
        let _ = serial;
    }
}

/// External tool invocation helper: argument logging, wall-clock timeout,
/// stderr capture into errors
#[derive(Debug, Clone)]
pub struct ToolRunner {
    command_timeout: Duration,
}

impl ToolRunner {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Run a tool and return its stdout as a string
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.run_with_timeout(program, args, self.command_timeout).await
    }

    /// Run a tool with an explicit wall-clock deadline
    pub async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<String> {
        let output = self.output(program, args, deadline).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LabError::tool(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a tool and return the raw output; the child is killed on timeout
    pub async fn output(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<std::process::Output> {
        debug!("Invoking {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let fut = cmd.output();
        match timeout(deadline, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(LabError::tool(format!("failed to invoke {}: {}", program, e))),
            Err(_) => {
                warn!("{} timed out after {:?}", program, deadline);
                Err(LabError::timeout(format!(
                    "{} did not complete within {}s",
                    program,
                    deadline.as_secs()
                )))
            }
        }
    }
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runner_captures_stdout() {
        let runner = ToolRunner::default();
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_runner_missing_tool_is_tool_error() {
        let runner = ToolRunner::default();
        let err = runner.run("definitely-not-a-real-tool-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, LabError::ExternalTool(_)));
    }

    #[tokio::test]
    async fn test_runner_nonzero_exit_carries_stderr() {
        let runner = ToolRunner::default();
        let err = runner
            .run("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_runner_timeout_kills_child() {
        let runner = ToolRunner::default();
        let err = runner
            .run_with_timeout("sleep", &["30"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout(_)));
    }
}
