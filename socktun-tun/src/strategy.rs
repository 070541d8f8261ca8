//! Loop-avoidance strategies
//!
//! A tunnel that captures the default route would also capture the
//! connection to the proxy it tunnels through. Two interchangeable strategies
//! keep the proxy's address off the tunnel:
//!
//! - [`ExcludeRoutes`]: route everything and exclude the proxy and bypass
//!   addresses with the platform's exclusion primitive.
//! - [`SplitRoutes`]: install the [`plan_exclusion`] blocks as explicit
//!   routes, for platforms without an exclusion primitive.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::exclusion::plan_exclusion;
use crate::route::{default_net, RouteTable};

/// Addresses that must not be captured by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionTargets {
    /// Resolved proxy address; `None` when name resolution failed
    pub proxy: Option<Ipv4Addr>,
    /// Fixed bypass address used to avoid DNS loops
    pub bypass: Ipv4Addr,
}

/// Produces the route table for a tunnel interface
pub trait RouteStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Build the route table for the given targets
    fn plan(&self, targets: &ExclusionTargets) -> RouteTable;
}

/// Default route plus direct exclusions
#[derive(Debug, Clone, Copy, Default)]
pub struct ExcludeRoutes;

impl RouteStrategy for ExcludeRoutes {
    fn name(&self) -> &'static str {
        "exclude"
    }

    fn plan(&self, targets: &ExclusionTargets) -> RouteTable {
        let mut excluded = Vec::with_capacity(2);
        if let Some(proxy) = targets.proxy {
            excluded.push(Ipv4Net::from(proxy));
        }
        if targets.proxy != Some(targets.bypass) {
            excluded.push(Ipv4Net::from(targets.bypass));
        }

        RouteTable {
            routes: vec![default_net()],
            excluded,
        }
    }
}

/// Explicit routes around the proxy address
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitRoutes;

impl RouteStrategy for SplitRoutes {
    fn name(&self) -> &'static str {
        "split"
    }

    fn plan(&self, targets: &ExclusionTargets) -> RouteTable {
        match targets.proxy {
            Some(proxy) => RouteTable {
                routes: plan_exclusion(proxy).networks(),
                excluded: Vec::new(),
            },
            None => {
                log::warn!("Proxy address unknown, routing 0.0.0.0/0 into the tunnel (risk of loop)");
                RouteTable::route_all()
            }
        }
    }
}

/// Pick the strategy matching the platform's capabilities
pub fn select_strategy(supports_exclusion: bool) -> Box<dyn RouteStrategy> {
    if supports_exclusion {
        Box::new(ExcludeRoutes)
    } else {
        Box::new(SplitRoutes)
    }
}
