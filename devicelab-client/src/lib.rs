//! Device Lab Client Library
//!
//! Client-side connection management for the devicelab realtime channel.

pub mod connection;

pub use connection::{ConnectionState, LabConnection, ReconnectPolicy};
