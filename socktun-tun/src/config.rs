//! Tunnel interface configuration

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::route::RouteTable;
use crate::{DEFAULT_ADDRESS, DEFAULT_MTU};

/// Everything a platform needs to open the tunnel interface
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    /// Interface name (optional, auto-generated if not specified)
    pub name: Option<String>,
    /// Human-readable session label shown by platforms that display one
    pub session_name: String,
    /// Local tunnel address
    pub address: Ipv4Addr,
    /// Prefix length of the local address
    pub prefix_len: u8,
    /// Maximum transmission unit
    pub mtu: u16,
    /// Routes captured and excluded by the interface
    pub routes: RouteTable,
    /// Keep this process's own traffic off the tunnel
    pub exclude_self: bool,
}

impl Default for InterfaceSpec {
    fn default() -> Self {
        Self {
            name: None,
            session_name: "socktun".to_string(),
            address: DEFAULT_ADDRESS,
            prefix_len: 32,
            mtu: DEFAULT_MTU,
            routes: RouteTable::default(),
            exclude_self: true,
        }
    }
}

impl InterfaceSpec {
    /// Create a new interface builder
    pub fn builder() -> InterfaceSpecBuilder {
        InterfaceSpecBuilder::new()
    }

    /// Validate the interface settings
    pub fn validate(&self) -> Result<()> {
        if self.prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                self.prefix_len
            )));
        }

        if self.mtu < 68 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.mtu
            )));
        }

        if self.routes.routes.is_empty() {
            return Err(Error::Config("at least one route must be configured".into()));
        }

        Ok(())
    }
}

/// Builder for InterfaceSpec
#[derive(Debug, Default)]
pub struct InterfaceSpecBuilder {
    spec: InterfaceSpec,
}

impl InterfaceSpecBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    /// Set the session label
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.spec.session_name = name.into();
        self
    }

    /// Set the local address and prefix length
    pub fn address(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.spec.address = address.into();
        self.spec.prefix_len = prefix_len;
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.spec.mtu = mtu;
        self
    }

    /// Set the route table
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.spec.routes = routes;
        self
    }

    /// Keep this process's own traffic off the tunnel
    pub fn exclude_self(mut self, enabled: bool) -> Self {
        self.spec.exclude_self = enabled;
        self
    }

    /// Build and validate the interface settings
    pub fn build(self) -> Result<InterfaceSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
