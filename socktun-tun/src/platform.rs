//! Platform abstraction for opening tunnel interfaces
//!
//! A [`TunPlatform`] turns an [`InterfaceSpec`] into an open interface. On a
//! desktop host this means creating a TUN device and installing routes; on a
//! mobile OS it means asking the VPN framework (which may prompt the user)
//! for a descriptor. Either way the result is an [`InterfaceHandle`] that owns
//! the descriptor until it is closed.

use async_trait::async_trait;

use crate::config::InterfaceSpec;
use crate::error::Result;

/// Platform file descriptor for an open tunnel interface
pub type TunFd = i32;

/// Resources that stay alive while the interface is open
#[async_trait]
pub trait InterfaceResource: Send {
    /// Release the descriptor and undo any system changes
    async fn close(&mut self) -> Result<()>;
}

/// Platform that can open tunnel interfaces
#[async_trait]
pub trait TunPlatform: Send + Sync {
    /// Whether routes can be excluded directly
    fn supports_route_exclusion(&self) -> bool;

    /// Open the interface described by `spec`
    ///
    /// Returns [`Error::PermissionDenied`](crate::Error::PermissionDenied)
    /// when the user or OS declines, and
    /// [`Error::NotSupported`](crate::Error::NotSupported) when the route
    /// table uses a primitive the platform cannot express. Nothing is left
    /// open on error.
    async fn establish(&self, spec: &InterfaceSpec) -> Result<InterfaceHandle>;
}

/// An open tunnel interface
///
/// Closing consumes the handle, so the descriptor is released at most once.
pub struct InterfaceHandle {
    fd: TunFd,
    name: String,
    mtu: u16,
    resource: Option<Box<dyn InterfaceResource>>,
}

impl InterfaceHandle {
    /// Wrap an open interface
    pub fn new(
        fd: TunFd,
        name: impl Into<String>,
        mtu: u16,
        resource: Box<dyn InterfaceResource>,
    ) -> Self {
        Self {
            fd,
            name: name.into(),
            mtu,
            resource: Some(resource),
        }
    }

    /// Raw descriptor handed to the forwarding engine
    pub fn fd(&self) -> TunFd {
        self.fd
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Close the interface
    pub async fn close(mut self) -> Result<()> {
        match self.resource.take() {
            Some(mut resource) => {
                log::info!("Closing tunnel interface {} (fd {})", self.name, self.fd);
                resource.close().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        if self.resource.is_some() {
            log::warn!(
                "Tunnel interface {} dropped without close, routes may linger",
                self.name
            );
        }
    }
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("fd", &self.fd)
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("open", &self.resource.is_some())
            .finish()
    }
}
