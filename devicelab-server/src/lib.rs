//! Device Lab Server Library
//!
//! Exposes the orchestrator components for the server binary and for
//! integration tests.

pub mod hub;
pub mod mirror;
pub mod registry;
pub mod sessions;
pub mod supervisor;
pub mod testing;

pub use hub::{EventHub, RequestRouter};
pub use mirror::MirrorPumps;
pub use registry::DeviceRegistry;
pub use sessions::SessionManager;
pub use supervisor::DriverSupervisor;
