//! Route exclusion planning
//!
//! Computes the set of IPv4 CIDR blocks covering the whole address space
//! except one address. Installing these blocks as tunnel routes captures all
//! traffic while leaving the proxy's own address on the physical link, which
//! is how the tunnel avoids a routing loop on platforms that cannot exclude
//! routes directly.
//!
//! The space is treated as a binary trie rooted at `0.0.0.0/0`. Walking from
//! the root toward the excluded address, every level emits the half that does
//! not contain it. The final /32 is the excluded address itself and is
//! discarded, so every plan holds exactly 32 blocks, one per prefix length.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// A contiguous IPv4 block: a network address plus prefix length
///
/// The low `32 - prefix_len` bits of `base` are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    base: u32,
    prefix_len: u8,
}

impl AddressRange {
    /// Create a range, rejecting host addresses and prefixes above 32
    pub fn new(base: impl Into<u32>, prefix_len: u8) -> Result<Self> {
        let base = base.into();
        if prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                prefix_len
            )));
        }
        let range = Self { base, prefix_len };
        if base & !range.mask() != 0 {
            return Err(Error::InvalidAddress(format!(
                "{}/{} is not a network address",
                Ipv4Addr::from(base),
                prefix_len
            )));
        }
        Ok(range)
    }

    /// The whole IPv4 space, `0.0.0.0/0`
    pub const fn all() -> Self {
        Self {
            base: 0,
            prefix_len: 0,
        }
    }

    /// A single-address block
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            base: addr.into(),
            prefix_len: 32,
        }
    }

    /// Network address of the block
    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    /// Prefix length of the block
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - n),
        }
    }

    /// Number of addresses covered
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    /// Last address in the block
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base | !self.mask())
    }

    /// Check whether the block covers `addr`
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == self.base
    }

    /// Check whether two blocks share any address
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        // CIDR blocks either nest or are disjoint
        let shorter = self.prefix_len.min(other.prefix_len);
        let mask = AddressRange {
            base: 0,
            prefix_len: shorter,
        }
        .mask();
        self.base & mask == other.base & mask
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base(), self.prefix_len)
    }
}

impl From<AddressRange> for Ipv4Net {
    fn from(range: AddressRange) -> Self {
        // prefix_len <= 32 is an invariant of AddressRange
        Ipv4Net::new(range.base(), range.prefix_len)
            .unwrap_or_else(|_| Ipv4Net::from(range.base()))
    }
}

impl From<Ipv4Net> for AddressRange {
    fn from(net: Ipv4Net) -> Self {
        let net = net.trunc();
        Self {
            base: net.network().into(),
            prefix_len: net.prefix_len(),
        }
    }
}

/// Blocks covering every IPv4 address except one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    excluded: Ipv4Addr,
    blocks: Vec<AddressRange>,
}

impl RoutePlan {
    /// The address left out of the plan
    pub fn excluded(&self) -> Ipv4Addr {
        self.excluded
    }

    /// Blocks ordered by ascending prefix length
    pub fn blocks(&self) -> &[AddressRange] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Check whether any block covers `addr`
    pub fn covers(&self, addr: Ipv4Addr) -> bool {
        self.blocks.iter().any(|b| b.contains(addr))
    }

    /// Total number of addresses routed by the plan
    pub fn covered_addresses(&self) -> u64 {
        self.blocks.iter().map(AddressRange::size).sum()
    }

    /// Blocks as `ipnet` networks, ready to install as routes
    pub fn networks(&self) -> Vec<Ipv4Net> {
        self.blocks.iter().copied().map(Ipv4Net::from).collect()
    }
}

impl IntoIterator for RoutePlan {
    type Item = AddressRange;
    type IntoIter = std::vec::IntoIter<AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// Plan routes for the whole IPv4 space minus `excluded`
pub fn plan_exclusion(excluded: Ipv4Addr) -> RoutePlan {
    let target = u32::from(excluded);
    let mut blocks = Vec::with_capacity(32);
    let mut current = 0u32;

    for depth in 0..32u8 {
        let bit = 1u32 << (31 - depth);
        let sibling = if target & bit == 0 { current | bit } else { current };
        blocks.push(AddressRange {
            base: sibling,
            prefix_len: depth + 1,
        });
        current |= target & bit;
    }

    RoutePlan { excluded, blocks }
}
