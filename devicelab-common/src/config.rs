//! Configuration management for the device lab controller
//!
//! Configuration is resolved in three layers: built-in defaults, an optional
//! TOML file, then environment variable overrides. CLI flags are applied on
//! top by the binaries.

use crate::{LabError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Listener and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_connections: usize,
    /// "production" tightens the per-connection request rate threshold
    pub environment: String,
    /// Origins/addresses admitted on the push channel; empty admits all
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            max_connections: 50,
            environment: "development".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Per-connection request rate ceiling, requests per minute
    pub fn rate_limit(&self) -> u32 {
        if self.environment == "production" {
            120
        } else {
            600
        }
    }
}

/// Discovery cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_secs: u64,
    pub health_interval_secs: u64,
    /// Seed a handful of synthetic offline devices at startup (demo aid)
    pub seed_offline_devices: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            health_interval_secs: 30,
            seed_offline_devices: false,
        }
    }
}

/// Platform adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub adb_path: Option<String>,
    pub command_timeout_secs: u64,
    pub screenshot_timeout_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            command_timeout_secs: 30,
            screenshot_timeout_secs: 10,
        }
    }
}

/// Driver-server supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub binary: String,
    pub base_port: u16,
    pub port_range: u16,
    pub start_timeout_secs: u64,
    pub log_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            binary: "appium".to_string(),
            base_port: 4723,
            port_range: 100,
            start_timeout_secs: 30,
            log_capacity: 500,
        }
    }
}

/// Screen-mirror pump configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// FPS ceiling for Android and physical iOS devices
    pub physical_fps_cap: u32,
    /// FPS ceiling for simulators
    pub simulator_fps_cap: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            physical_fps_cap: 1,
            simulator_fps_cap: 5,
        }
    }
}

/// Reservation and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_duration_minutes: u64,
    /// Auto-release reservations past their deadline
    pub reaper_enabled: bool,
    pub reaper_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_duration_minutes: 60,
            reaper_enabled: false,
            reaper_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Upload staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub staging_dir: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir()
                .join("devicelab-uploads")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LabConfig {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub adapters: AdapterConfig,
    pub driver: DriverConfig,
    pub mirror: MirrorConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
    pub uploads: UploadConfig,
}

impl LabConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| LabError::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: LabConfig = toml::from_str(&contents)
            .map_err(|e| LabError::config(format!("failed to parse {}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(env) = std::env::var("DEVICELAB_ENV") {
            self.server.environment = env;
        }
        if let Ok(origins) = std::env::var("FRONTEND_URL") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Validate configuration values before startup
    pub fn validate(&self) -> Result<()> {
        if self.driver.port_range == 0 {
            return Err(LabError::config("driver.port_range must be at least 1"));
        }
        if self.driver.base_port.checked_add(self.driver.port_range).is_none() {
            return Err(LabError::config("driver port range overflows the port space"));
        }
        if self.mirror.physical_fps_cap == 0 || self.mirror.simulator_fps_cap == 0 {
            return Err(LabError::config("mirror FPS caps must be at least 1"));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LabError::config(format!("unknown log level: {}", other)));
            }
        }
        Ok(())
    }
}
