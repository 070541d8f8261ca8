//! Control socket for IPC with a running daemon
//!
//! One JSON object per line in each direction: the client writes a
//! [`ControlRequest`], the daemon answers with a [`ControlResponse`]. This is
//! the CONNECT/DISCONNECT command layer for other processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use crate::endpoint::{Command, ProxyEndpoint};
use crate::error::{Error, Result};
use crate::event::{SessionSnapshot, SessionState, Status};
use crate::session::SessionController;
use crate::store::{run_blocking, ProfileStore, SelectedProfile};

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/socktun.sock";

/// Time a client waits for the daemon to answer
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Start a session; fields arrive as text and are validated by the daemon
    #[serde(rename = "connect")]
    Connect {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pass: Option<String>,
    },

    /// Stop the current session
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Get the current session state
    #[serde(rename = "status")]
    Status,

    /// Request graceful shutdown
    #[serde(rename = "shutdown")]
    Shutdown,
}

impl ControlRequest {
    /// Connect request for a known endpoint
    pub fn connect(endpoint: &ProxyEndpoint) -> Self {
        ControlRequest::Connect {
            host: Some(endpoint.host.clone()),
            port: Some(endpoint.port.to_string()),
            user: endpoint.user.clone(),
            pass: endpoint.pass.clone(),
        }
    }
}

/// Response messages from the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Status response
    #[serde(rename = "status")]
    Status(StatusInfo),

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },

    /// Success acknowledgment
    #[serde(rename = "ok")]
    Ok,
}

/// Session status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Internal state name
    pub state: String,
    /// External status, absent while disconnecting
    pub status: Option<Status>,
    /// Id of the latest session
    pub session_id: u64,
    /// Endpoint of the latest session
    pub endpoint: Option<String>,
    /// Failure message
    pub message: Option<String>,
}

impl From<&SessionSnapshot> for StatusInfo {
    fn from(snapshot: &SessionSnapshot) -> Self {
        let message = match snapshot.state {
            SessionState::Failed(ref reason) => Some(reason.message.clone()),
            _ => None,
        };
        Self {
            state: snapshot.state.description().trim_end_matches("...").to_string(),
            status: snapshot.state.status(),
            session_id: snapshot.session_id,
            endpoint: snapshot.endpoint.as_ref().map(|e| e.to_string()),
            message,
        }
    }
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    controller: SessionController,
    store: Option<Arc<dyn ProfileStore>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(socket_path: impl AsRef<Path>, controller: SessionController) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            controller,
            store: None,
            shutdown_tx: None,
        }
    }

    /// Save endpoints from connect requests as profiles
    pub fn with_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Allow `shutdown` requests to signal `tx`
    pub fn with_shutdown(mut self, tx: broadcast::Sender<()>) -> Self {
        self.shutdown_tx = Some(tx);
        self
    }

    /// Bind the socket
    #[cfg(unix)]
    pub fn bind(&self) -> Result<tokio::net::UnixListener> {
        // Remove existing socket file
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = tokio::net::UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Control(format!("failed to bind control socket: {}", e)))?;

        // Owner read/write only
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&self.socket_path, perms);

        log::info!("Control socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Bind and serve until the task is dropped
    #[cfg(unix)]
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener
    #[cfg(unix)]
    pub async fn serve(self: Arc<Self>, listener: tokio::net::UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }

    #[cfg(unix)]
    async fn handle_connection(&self, stream: tokio::net::UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        // Read request (single line JSON)
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Control(format!("failed to read request: {}", e)))?;

        if line.is_empty() {
            return Ok(());
        }

        let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => ControlResponse::Error {
                message: format!("invalid request: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)
            .map_err(|e| Error::Control(format!("failed to serialize response: {}", e)))?;

        writer
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("failed to write response: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Control(format!("failed to write newline: {}", e)))?;

        Ok(())
    }

    async fn handle_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Connect {
                host,
                port,
                user,
                pass,
            } => match Command::connect(
                host.as_deref(),
                port.as_deref(),
                user.as_deref(),
                pass.as_deref(),
            ) {
                Ok(command) => self.execute(command).await,
                Err(e) => error_response(e),
            },
            ControlRequest::Disconnect => self.execute(Command::Disconnect).await,
            ControlRequest::Status => {
                ControlResponse::Status(StatusInfo::from(&self.controller.snapshot()))
            }
            ControlRequest::Shutdown => match self.shutdown_tx {
                Some(ref tx) => {
                    let _ = tx.send(());
                    ControlResponse::Ok
                }
                None => ControlResponse::Error {
                    message: "shutdown not available".into(),
                },
            },
        }
    }

    async fn execute(&self, command: Command) -> ControlResponse {
        match command {
            Command::Connect(endpoint) => self.connect(endpoint).await,
            Command::Disconnect => match self.controller.disconnect().await {
                Ok(()) => ControlResponse::Ok,
                Err(e) => error_response(e),
            },
        }
    }

    async fn connect(&self, endpoint: ProxyEndpoint) -> ControlResponse {
        let state = match self.controller.connect(endpoint.clone()).await {
            Ok(state) => state,
            Err(e) => {
                // the store keeps describing the session that is live
                if e.is_rejection() {
                    log::debug!("Connect to {} rejected: {}", endpoint, e);
                } else {
                    log::warn!("Connect to {} failed: {}", endpoint, e);
                }
                return error_response(e);
            }
        };

        if let Some(ref store) = self.store {
            let saved = endpoint.clone();
            let status = state.status();
            let result = run_blocking(store, move |store| remember(store, saved, status)).await;
            if let Err(e) = result {
                log::warn!("Failed to save profile {}: {}", endpoint, e);
            }
        }

        ControlResponse::Status(StatusInfo::from(&self.controller.snapshot()))
    }

    /// Cleanup the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Save `endpoint` and make it the selected profile with the status the
/// session reached
fn remember(
    store: &dyn ProfileStore,
    endpoint: ProxyEndpoint,
    status: Option<Status>,
) -> Result<()> {
    if !store.profiles()?.contains(&endpoint) {
        store.add(endpoint.clone())?;
    }
    store.select(SelectedProfile { endpoint, status })
}

fn error_response(err: Error) -> ControlResponse {
    ControlResponse::Error {
        message: err.to_string(),
    }
}

/// Control socket client for talking to a running daemon
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a request and get a response
    #[cfg(unix)]
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        use tokio::net::UnixStream;

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "failed to connect to control socket at {:?}: {}. Is the daemon running?",
                self.socket_path, e
            ))
        })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // Send request
        let request_json = serde_json::to_string(&request)
            .map_err(|e| Error::Control(format!("failed to serialize request: {}", e)))?;
        writer
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("failed to send request: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Control(format!("failed to send newline: {}", e)))?;

        // Read response
        let mut line = String::new();
        tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout("waiting for control response".into()))?
            .map_err(|e| Error::Control(format!("failed to read response: {}", e)))?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("invalid response: {}", e)))?;

        Ok(response)
    }

    /// Start a session
    pub async fn connect(&self, endpoint: &ProxyEndpoint) -> Result<StatusInfo> {
        match self.request(ControlRequest::connect(endpoint)).await? {
            ControlResponse::Status(info) => Ok(info),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }

    /// Stop the current session
    pub async fn disconnect(&self) -> Result<()> {
        match self.request(ControlRequest::Disconnect).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }

    /// Get status from the running daemon
    pub async fn status(&self) -> Result<StatusInfo> {
        match self.request(ControlRequest::Status).await? {
            ControlResponse::Status(info) => Ok(info),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }

    /// Request shutdown
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(ControlRequest::Shutdown).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }
}
