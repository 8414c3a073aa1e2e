//! Audio control error types
//!
//! This module defines unified error types for all audio control operations.
//! Platform-specific errors are mapped to these generic error variants.

use thiserror::Error;

/// Unified error type for audio control operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioControlError {
    /// Native enumeration or default-device query failed
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
    /// Stable id or handle no longer resolves (usually raced with removal)
    #[error("Device not found: {0}")]
    NotFound(String),
    /// Device exists but exposes no output streams
    #[error("Device is not output capable: {0}")]
    NotOutputCapable(String),
    /// Device exists but exposes no input streams
    #[error("Device is not input capable: {0}")]
    NotInputCapable(String),
    /// Native call failed with a backend status code (OSStatus / HRESULT)
    #[error("Platform error {code}: {message}")]
    Platform { code: i32, message: String },
    /// Operation not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// Configuration could not be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AudioControlError {
    pub fn platform(code: i32, message: impl Into<String>) -> Self {
        Self::Platform {
            code,
            message: message.into(),
        }
    }

    /// Benign in event paths: the device is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for audio control operations
pub type Result<T> = std::result::Result<T, AudioControlError>;
