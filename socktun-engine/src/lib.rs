//! socktun session engine
//!
//! This crate drives a SOCKS tunnel session: it builds the tunnel interface
//! for a proxy endpoint, runs the packet-forwarding engine on it and reports
//! the session state. It is shared by the `socktun` daemon and anything else
//! that embeds the tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   socktun-cli   │──control────▶│   ControlServer     │   │
//! │  └─────────────────┘   socket     └──────────┬──────────┘   │
//! │                                              ▼              │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   socktun-engine                       │ │
//! │  │  - SessionController (state machine, worker, teardown) │ │
//! │  │  - TunnelInterfaceBuilder (resolve, plan routes, open) │ │
//! │  │  - TunnelEngine (tun2socks boundary)                   │ │
//! │  │  - Events, Config, ProfileStore                        │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │  socktun-tun                                           │ │
//! │  │  - Route exclusion planner and strategies              │ │
//! │  │  - TunPlatform / InterfaceHandle, Linux TUN + routes   │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod interface;
pub mod session;
pub mod store;

pub use config::{Config, ControlConfig, EngineConfig, StoreConfig, TunnelConfig};
pub use control::{
    ControlClient, ControlRequest, ControlResponse, ControlServer, StatusInfo, DEFAULT_SOCKET_PATH,
};
pub use endpoint::{Command, ProxyEndpoint};
pub use engine::{CommandEngine, EngineInvocation, EngineKind, TunnelEngine};
#[cfg(feature = "native-engine")]
pub use engine::NativeEngine;
pub use error::{Error, Result};
pub use event::{
    EventHandler, FailureKind, FailureReason, LoggingEventHandler, SessionEvent, SessionSnapshot,
    SessionState, Status, StatusNotification,
};
pub use interface::{BuiltInterface, HostResolver, SystemResolver, TunnelInterfaceBuilder};
pub use session::{SessionController, SessionControllerBuilder};
pub use store::{run_blocking, JsonProfileStore, MemoryProfileStore, ProfileStore, SelectedProfile};
