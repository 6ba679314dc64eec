//! Device Lab Common Library
//!
//! Shared types, error handling, configuration, the wire protocol, the
//! framed transport, and the platform adapters for the device lab
//! controller.

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod net;
pub mod ring;
pub mod types;

pub use adapter::{
    AndroidAdapter, DeviceAdapter, DeviceFacts, DiscoveredDevice, IosAdapter, LogSink,
    LogTailHandle, ToolRunner,
};
pub use config::{
    AdapterConfig, DiscoveryConfig, DriverConfig, LabConfig, LoggingConfig, MirrorConfig,
    ServerConfig, SessionConfig, UploadConfig,
};
pub use error::{ErrorCategory, LabError, Result};
pub use events::{Envelope, Event, EventSink, NullSink, Request, RequestFrame};
pub use filter::DriverLogFilter;
pub use logging::{init_logging, init_logging_with_level};
pub use net::{LabClient, OriginAllowlist};
pub use ring::LogRing;
pub use types::*;
