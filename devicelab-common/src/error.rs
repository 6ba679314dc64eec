//! Error handling for the device lab controller

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the device lab controller
pub type Result<T> = std::result::Result<T, LabError>;

/// Main error type for the device lab controller
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum LabError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("external tool failure: {0}")]
    ExternalTool(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("server error: {0}")]
    Server(String),
}

impl LabError {
    /// Create a new not-found error for a resource kind and id
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new invalid-state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new resource exhaustion error
    pub fn resource_exhaustion<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhaustion(msg.into())
    }

    /// Create a new external tool error
    pub fn tool<S: Into<String>>(msg: S) -> Self {
        Self::ExternalTool(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new unsupported-operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new server error
    pub fn server<S: Into<String>>(msg: S) -> Self {
        Self::Server(msg.into())
    }

    /// Get the error category for classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState(_) | Self::Validation(_) => ErrorCategory::Request,
            Self::ResourceExhaustion(_) => ErrorCategory::Resource,
            Self::ExternalTool(_) => ErrorCategory::Tool,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Unsupported(_) => ErrorCategory::Unsupported,
            Self::Network(_) => ErrorCategory::Transport,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::Serialization(_) | Self::Server(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the condition may clear on its own and the operation can be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound { .. } => true, // device might come back online
            Self::ResourceExhaustion(_) | Self::Timeout(_) | Self::Network(_) => true,
            Self::ExternalTool(_) => true, // tool may be installed or device reattached
            Self::InvalidState(_) | Self::Validation(_) | Self::Unsupported(_) => false,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) | Self::Server(_) => false,
        }
    }

    /// Whether this error should trigger load shedding (e.g. stopping a mirror pump)
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhaustion(_))
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for LabError {
    fn from(err: anyhow::Error) -> Self {
        Self::Server(err.to_string())
    }
}

/// Error categories mirroring the user-visible failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    NotFound,
    Request,
    Resource,
    Tool,
    Timeout,
    Unsupported,
    Transport,
    Configuration,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LabError::not_found("device", "d-123");
        assert_eq!(err.to_string(), "device not found: d-123");

        let err = LabError::invalid_state("device is offline");
        assert_eq!(err.to_string(), "invalid state: device is offline");

        let err = LabError::unsupported("shell is not supported for iOS devices");
        assert!(err.to_string().contains("iOS"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            LabError::not_found("session", "s-1").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            LabError::resource_exhaustion("no available ports").category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            LabError::timeout("screenshot exceeded 10s").category(),
            ErrorCategory::Timeout
        );
        assert_eq!(LabError::tool("adb exited 1").category(), ErrorCategory::Tool);
    }

    #[test]
    fn test_exhaustion_flag() {
        assert!(LabError::resource_exhaustion("spawn failed").is_exhaustion());
        assert!(!LabError::tool("adb missing").is_exhaustion());
    }

    #[test]
    fn test_error_serialization_round_trip() {
        let err = LabError::not_found("reservation", "r-9");
        let json = serde_json::to_string(&err).unwrap();
        let back: LabError = serde_json::from_str(&json).unwrap();
        assert_eq!(err.to_string(), back.to_string());
    }
}
