//! Linux tunnel platform
//!
//! Opens a TUN device with `tun-rs` and steers traffic into it with host
//! routes. Linux has no per-interface exclusion primitive, so exclusions are
//! pinned as /32 routes via the existing default gateway, and the default
//! route is installed as two /1 halves that win over the host's own default.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::config::InterfaceSpec;
use crate::device::TunDevice;
use crate::error::{Error, Result};
use crate::platform::{InterfaceHandle, InterfaceResource, TunPlatform};
use crate::route::{split_default, AppliedRoutes, Route, RouteManager};

/// Check if the TUN kernel module is loaded
pub fn is_tun_available() -> bool {
    std::path::Path::new("/dev/net/tun").exists()
}

/// TUN device plus host routes
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }

    fn plan_routes(spec: &InterfaceSpec, device: &str, gateway: Option<Ipv4Addr>) -> Result<Vec<Route>> {
        let mut routes = Vec::new();

        if spec.routes.has_exclusions() {
            let gw = gateway.ok_or_else(|| {
                Error::NotSupported("no default gateway to pin excluded routes to".into())
            })?;
            for net in &spec.routes.excluded {
                routes.push(Route::via(*net, gw));
            }
        }

        for net in &spec.routes.routes {
            for half in split_default(*net) {
                routes.push(Route::interface_route(half, device));
            }
        }

        Ok(routes)
    }
}

#[async_trait]
impl TunPlatform for LinuxPlatform {
    fn supports_route_exclusion(&self) -> bool {
        true
    }

    async fn establish(&self, spec: &InterfaceSpec) -> Result<InterfaceHandle> {
        spec.validate()?;

        if !is_tun_available() {
            return Err(Error::DeviceCreation("/dev/net/tun is not available".into()));
        }

        let manager = RouteManager::new().await?;
        let gateway = if spec.routes.has_exclusions() {
            let gw = manager.default_gateway().await?;
            if gw.is_none() {
                return Err(Error::NotSupported(
                    "no default gateway to pin excluded routes to".into(),
                ));
            }
            gw
        } else {
            None
        };

        if spec.exclude_self {
            log::debug!("Per-process exclusion is not expressible with host routes, skipping");
        }

        let device = TunDevice::create(spec)?;
        let routes = Self::plan_routes(spec, device.name(), gateway)?;
        // Dropping the device on error closes it
        let applied = manager.apply(routes).await?;

        let fd = device.as_raw_fd();
        let name = device.name().to_string();
        let mtu = device.mtu();

        Ok(InterfaceHandle::new(
            fd,
            name,
            mtu,
            Box::new(LinuxInterface {
                device: Some(device),
                manager,
                applied,
            }),
        ))
    }
}

struct LinuxInterface {
    device: Option<TunDevice>,
    manager: RouteManager,
    applied: AppliedRoutes,
}

#[async_trait]
impl InterfaceResource for LinuxInterface {
    async fn close(&mut self) -> Result<()> {
        self.applied.cleanup(&self.manager).await;
        if let Some(device) = self.device.take() {
            log::info!("Closing TUN device {}", device.name());
        }
        Ok(())
    }
}
