//! Error types for the session engine

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a tunnel session
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed host/port, rejected before any resource is touched
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The platform declined to grant the virtual interface
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Interface setup failed after permission was granted
    #[error("interface creation failed: {0}")]
    InterfaceCreation(String),

    /// The forwarding engine could not be started
    #[error("engine launch failed: {0}")]
    EngineLaunch(String),

    /// The forwarding engine exited abnormally
    #[error("engine exited with code {code}")]
    EngineRuntime { code: i32 },

    /// A session is already active
    #[error("a tunnel session is already active")]
    SessionBusy,

    /// A graceful stop did not complete in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile store error
    #[error("profile store error: {0}")]
    Store(String),

    /// Control socket error
    #[error("control error: {0}")]
    Control(String),
}

impl Error {
    /// Check if this error is a synchronous rejection that left no trace
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::SessionBusy)
    }
}

impl From<socktun_tun::Error> for Error {
    fn from(err: socktun_tun::Error) -> Self {
        if err.is_permission_denied() {
            Error::PermissionDenied(err.to_string())
        } else {
            Error::InterfaceCreation(err.to_string())
        }
    }
}
