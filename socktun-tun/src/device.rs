//! TUN device wrapper
//!
//! A thin wrapper around `tun-rs`'s blocking device. The forwarding engine
//! reads and writes the raw descriptor itself, so the device is only kept
//! alive here and never polled.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::config::InterfaceSpec;
use crate::error::{Error, Result};

/// Information about a TUN device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Interface name
    pub name: String,
    /// MTU
    pub mtu: u16,
}

/// Blocking TUN device
pub struct TunDevice {
    inner: tun_rs::SyncDevice,
    info: DeviceInfo,
}

impl TunDevice {
    /// Create a TUN device with the requested name, address and MTU
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub fn create(spec: &InterfaceSpec) -> Result<Self> {
        spec.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new();

        if let Some(ref name) = spec.name {
            builder = builder.name(name);
        }

        builder = builder
            .ipv4(spec.address, spec.prefix_len, None)
            .mtu(spec.mtu);

        let device = builder.build_sync().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(format!("cannot create TUN device: {}", e))
            } else {
                Error::DeviceCreation(e.to_string())
            }
        })?;

        let name = device
            .name()
            .map_err(|e| Error::TunLib(e.to_string()))?;

        log::info!("Created TUN device: {} (MTU: {})", name, spec.mtu);

        Ok(Self {
            inner: device,
            info: DeviceInfo {
                name,
                mtu: spec.mtu,
            },
        })
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the MTU
    pub fn mtu(&self) -> u16 {
        self.info.mtu
    }

    /// Get the underlying file descriptor
    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .finish()
    }
}
