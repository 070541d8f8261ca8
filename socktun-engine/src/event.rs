//! Session events and state management

use serde::{Deserialize, Serialize};

use crate::endpoint::ProxyEndpoint;
use crate::error::Error;

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session; also the state after a clean disconnect
    Idle,
    /// Building the interface and launching the engine
    Connecting,
    /// Engine launched on the open interface
    Connected,
    /// Stop requested, waiting for the engine to return
    Disconnecting,
    /// The last attempt ended in error
    Failed(FailureReason),
}

impl SessionState {
    /// Idle and Failed are both at rest; a new connect may start from either
    pub fn is_at_rest(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed(_))
    }

    /// Check if a session is in flight
    pub fn is_active(&self) -> bool {
        !self.is_at_rest()
    }

    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// External status for this state, if it has one
    pub fn status(&self) -> Option<Status> {
        match self {
            SessionState::Idle => Some(Status::Disconnected),
            SessionState::Connecting => Some(Status::Connecting),
            SessionState::Connected => Some(Status::Connected),
            SessionState::Disconnecting => None,
            SessionState::Failed(_) => Some(Status::Error),
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting...",
            SessionState::Connected => "Connected",
            SessionState::Disconnecting => "Disconnecting...",
            SessionState::Failed(_) => "Failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "Failed ({})", reason),
            other => write!(f, "{}", other.description()),
        }
    }
}

/// Category of a session failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PermissionDenied,
    InterfaceCreation,
    EngineLaunch,
    EngineRuntime,
}

/// Why a session ended in [`SessionState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    /// Human-readable cause
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error raised while a session was in flight
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::EngineLaunch(_) => FailureKind::EngineLaunch,
            Error::EngineRuntime { .. } => FailureKind::EngineRuntime,
            _ => FailureKind::InterfaceCreation,
        };
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Status value published to external observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "CONNECTING",
            Status::Connected => "CONNECTED",
            Status::Disconnected => "DISCONNECTED",
            Status::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTING" => Ok(Status::Connecting),
            "CONNECTED" => Ok(Status::Connected),
            "DISCONNECTED" => Ok(Status::Disconnected),
            "ERROR" => Ok(Status::Error),
            other => Err(Error::Config(format!("unknown status '{}'", other))),
        }
    }
}

/// A status change as seen by external observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub status: Status,
    /// Endpoint of the session the status belongs to
    pub endpoint: Option<ProxyEndpoint>,
    /// Failure message, set only for [`Status::Error`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The shared state cell's value
///
/// `session_id` increases with every accepted connect, so stale writers from
/// an earlier session can be recognised and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub state: SessionState,
    pub endpoint: Option<ProxyEndpoint>,
}

impl SessionSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            session_id: 0,
            state: SessionState::Idle,
            endpoint: None,
        }
    }

    /// The notification observers get for this snapshot
    pub fn notification(&self) -> Option<StatusNotification> {
        let status = self.state.status()?;
        let message = match self.state {
            SessionState::Failed(ref reason) => Some(reason.message.clone()),
            _ => None,
        };
        Some(StatusNotification {
            status,
            endpoint: self.endpoint.clone(),
            message,
        })
    }
}

/// Events emitted by the session controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// Externally visible status changed
    Status(StatusNotification),

    /// Log message
    Log {
        /// Log level
        level: LogLevel,
        /// Message
        message: String,
    },
}

/// Log levels for session events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Event handler trait for receiving session events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a session event
    async fn on_event(&self, event: SessionEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new } => {
                log::info!("Session state: {} -> {}", old, new);
            }
            SessionEvent::Status(notification) => {
                let endpoint = notification
                    .endpoint
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "-".to_string());
                match notification.message {
                    Some(message) => {
                        log::warn!("Status {} ({}): {}", notification.status, endpoint, message)
                    }
                    None => log::info!("Status {} ({})", notification.status, endpoint),
                }
            }
            SessionEvent::Log { level, message } => match level {
                LogLevel::Debug => log::debug!("{}", message),
                LogLevel::Info => log::info!("{}", message),
                LogLevel::Warning => log::warn!("{}", message),
                LogLevel::Error => log::error!("{}", message),
            },
        }
    }
}
