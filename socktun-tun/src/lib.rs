//! Tunnel interface construction for socktun
//!
//! This crate builds the virtual network interface a SOCKS tunnel runs on
//! and keeps the proxy connection itself out of the tunnel.
//!
//! # Features
//!
//! - **Route Exclusion Planning**: the minimal CIDR cover of the IPv4 space
//!   minus one address ([`plan_exclusion`])
//! - **Route Strategies**: direct exclusion or explicit split routes, chosen
//!   by platform capability ([`select_strategy`])
//! - **Platform Abstraction**: [`TunPlatform`] opens an interface from an
//!   [`InterfaceSpec`] and returns an owned [`InterfaceHandle`]
//! - **Linux Support**: [`LinuxPlatform`] backed by `tun-rs` and `net-route`
//!
//! # Feature Flags
//!
//! - `async-tokio` (default): the Linux platform and route manager
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! # Example
//!
//! ```ignore
//! use socktun_tun::{select_strategy, ExclusionTargets, InterfaceSpec, LinuxPlatform, TunPlatform};
//!
//! let platform = LinuxPlatform::new();
//! let strategy = select_strategy(platform.supports_route_exclusion());
//! let routes = strategy.plan(&ExclusionTargets {
//!     proxy: Some("203.0.113.5".parse()?),
//!     bypass: "1.1.1.1".parse()?,
//! });
//!
//! let spec = InterfaceSpec::builder().mtu(1500).routes(routes).build()?;
//! let handle = platform.establish(&spec).await?;
//! println!("fd {} on {}", handle.fd(), handle.name());
//! handle.close().await?;
//! ```

use std::net::Ipv4Addr;

pub mod config;
pub mod error;
pub mod exclusion;
pub mod platform;
pub mod route;
pub mod strategy;

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub mod device;

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub mod linux;

pub use config::{InterfaceSpec, InterfaceSpecBuilder};
pub use error::{Error, Result};
pub use exclusion::{plan_exclusion, AddressRange, RoutePlan};
pub use platform::{InterfaceHandle, InterfaceResource, TunFd, TunPlatform};
pub use route::{default_net, Route, RouteTable};
pub use strategy::{select_strategy, ExcludeRoutes, ExclusionTargets, RouteStrategy, SplitRoutes};

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub use linux::LinuxPlatform;

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub use route::RouteManager;

/// Default MTU for the tunnel interface
pub const DEFAULT_MTU: u16 = 1500;

/// Default local tunnel address, installed as a /32
pub const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Default bypass address kept off the tunnel to avoid DNS loops
pub const DEFAULT_BYPASS_DNS: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
