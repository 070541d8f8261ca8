//! Error types for socktun-tun

use std::io;
use thiserror::Error;

/// Result type alias for socktun-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or tearing down a tunnel interface
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform refused to create the interface
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Permission or user consent was not granted
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Internal error from underlying TUN library
    #[error("TUN library error: {0}")]
    TunLib(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the platform lacks the requested primitive
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::Unsupported)
    }
}
