//! Route tables and route management
//!
//! [`RouteTable`] is the platform-neutral description of what a tunnel
//! interface should capture. [`RouteManager`] installs routes into the host
//! routing table on platforms where the tunnel is a plain TUN device.

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
use std::ffi::CString;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Convert an interface name to its index
#[cfg(all(target_os = "linux", feature = "async-tokio"))]
fn get_interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::Route(format!(
            "interface '{}' not found (os error {})",
            name,
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        )));
    }

    Ok(index)
}

/// The IPv4 default route, `0.0.0.0/0`
pub fn default_net() -> Ipv4Net {
    // prefix 0 is always valid
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap()
}

/// The routes a tunnel interface captures and the ones it leaves alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    /// Destinations sent into the tunnel
    pub routes: Vec<Ipv4Net>,
    /// Destinations kept off the tunnel even though a route covers them
    pub excluded: Vec<Ipv4Net>,
}

impl RouteTable {
    /// Everything into the tunnel, nothing excluded
    pub fn route_all() -> Self {
        Self {
            routes: vec![default_net()],
            excluded: Vec::new(),
        }
    }

    /// Check whether the table relies on the exclusion primitive
    pub fn has_exclusions(&self) -> bool {
        !self.excluded.is_empty()
    }

    /// Check whether traffic to `addr` would enter the tunnel
    pub fn captures(&self, addr: Ipv4Addr) -> bool {
        self.routes.iter().any(|net| net.contains(&addr))
            && !self.excluded.iter().any(|net| net.contains(&addr))
    }
}

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: Ipv4Net,
    /// Gateway address (None for direct/interface routes)
    pub gateway: Option<Ipv4Addr>,
    /// Interface name
    pub interface: Option<String>,
}

impl Route {
    /// Create a route via a gateway
    pub fn via(destination: Ipv4Net, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: None,
        }
    }

    /// Create an interface route (no gateway, traffic goes directly to interface)
    pub fn interface_route(destination: Ipv4Net, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: Some(interface.into()),
        }
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Split a default route into two /1 halves
///
/// The halves are more specific than the host's own default route, so they
/// win without the original default being removed.
pub fn split_default(net: Ipv4Net) -> Vec<Ipv4Net> {
    if net.prefix_len() != 0 {
        return vec![net];
    }
    net.subnets(1).map(|s| s.collect()).unwrap_or_else(|_| vec![net])
}

/// Route manager for adding/removing routes
///
/// Uses the `net-route` crate for route manipulation.
#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub struct RouteManager {
    handle: net_route::Handle,
}

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
impl RouteManager {
    /// Create a new route manager
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub async fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;

        Ok(Self { handle })
    }

    fn to_net_route(route: &Route, strict_interface: bool) -> Result<net_route::Route> {
        let mut net_route = net_route::Route::new(
            std::net::IpAddr::V4(route.destination.network()),
            route.destination.prefix_len(),
        );

        if let Some(gw) = route.gateway {
            net_route = net_route.with_gateway(std::net::IpAddr::V4(gw));
        }

        if let Some(ref iface) = route.interface {
            match get_interface_index(iface) {
                Ok(ifindex) => net_route = net_route.with_ifindex(ifindex),
                Err(e) if strict_interface => return Err(e),
                // Interface may already be gone during teardown
                Err(_) => {}
            }
        }

        Ok(net_route)
    }

    /// Add a route to the routing table
    pub async fn add(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route, true)?;

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
            }
            Err(e) => {
                // EEXIST: route already present
                if e.raw_os_error() == Some(libc::EEXIST) {
                    log::debug!("Route already exists: {}", route);
                } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return Err(Error::PermissionDenied(format!("failed to add route {}: {}", route, e)));
                } else {
                    return Err(Error::Route(format!("failed to add route {}: {}", route, e)));
                }
            }
        }

        Ok(())
    }

    /// Remove a route from the routing table
    pub async fn delete(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route, false)?;

        self.handle
            .delete(&net_route)
            .await
            .map_err(|e| Error::Route(format!("failed to delete route {}: {}", route, e)))?;

        log::info!("Deleted route: {}", route);
        Ok(())
    }

    /// Gateway of the host's current IPv4 default route, if any
    pub async fn default_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let routes = self
            .handle
            .list()
            .await
            .map_err(|e| Error::Route(format!("failed to list routes: {}", e)))?;

        let gateway = routes
            .into_iter()
            .filter(|r| r.prefix == 0)
            .find_map(|r| match r.gateway {
                Some(std::net::IpAddr::V4(gw)) => Some(gw),
                _ => None,
            });

        Ok(gateway)
    }

    /// Install routes, undoing the ones already added if any fails
    pub async fn apply(&self, routes: Vec<Route>) -> Result<AppliedRoutes> {
        let mut applied = AppliedRoutes { routes: Vec::new() };
        for route in routes {
            if let Err(e) = self.add(&route).await {
                applied.cleanup(self).await;
                return Err(e);
            }
            applied.routes.push(route);
        }
        Ok(applied)
    }
}

/// Tracks applied routes for cleanup
#[derive(Debug, Default)]
pub struct AppliedRoutes {
    routes: Vec<Route>,
}

impl AppliedRoutes {
    /// Get the applied routes
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Remove all applied routes, newest first
    #[cfg(all(target_os = "linux", feature = "async-tokio"))]
    pub async fn cleanup(&mut self, manager: &RouteManager) {
        for route in self.take_pending() {
            if let Err(e) = manager.delete(&route).await {
                log::debug!("Ignoring route cleanup failure: {}", e);
            }
        }
    }

    /// Hand over every route still installed, newest first
    #[cfg_attr(not(all(target_os = "linux", feature = "async-tokio")), allow(dead_code))]
    fn take_pending(&mut self) -> Vec<Route> {
        let mut routes = std::mem::take(&mut self.routes);
        routes.reverse();
        routes
    }
}

/// Routes still installed when the tracker goes away were abandoned mid-setup
/// (the establishing task was cancelled); remove them in the background.
#[cfg(all(target_os = "linux", feature = "async-tokio"))]
impl Drop for AppliedRoutes {
    fn drop(&mut self) {
        let routes = self.take_pending();
        if routes.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Leaving {} routes installed: no runtime to remove them", routes.len());
            return;
        };

        log::warn!("Removing {} routes left by an interrupted setup", routes.len());
        runtime.spawn(async move {
            let manager = match RouteManager::new().await {
                Ok(manager) => manager,
                Err(e) => {
                    log::warn!("Cannot remove abandoned routes: {}", e);
                    return;
                }
            };
            for route in routes {
                if let Err(e) = manager.delete(&route).await {
                    log::debug!("Ignoring route cleanup failure: {}", e);
                }
            }
        });
    }
}
