//! IP address and CIDR notation utilities.
//!
//! Provides [`Cidr`] for representing IPv4 and IPv6 blocks in CIDR notation,
//! along with the address arithmetic used to subdivide them. All arithmetic
//! runs on `u128` so both families share one code path; IPv4 addresses are
//! zero-extended into the low 32 bits.

use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::errors::CidrError;

/// Maximum prefix length for an IPv4 block (32 bits).
pub const MAX_LENGTH_V4: u8 = 32;
/// Maximum prefix length for an IPv6 block (128 bits).
pub const MAX_LENGTH_V6: u8 = 128;

/// Maximum prefix length for the address family of `addr`.
pub fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => MAX_LENGTH_V4,
        IpAddr::V6(_) => MAX_LENGTH_V6,
    }
}

fn addr_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn bits_to_addr(bits: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(bits as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(bits))
    }
}

/// All-ones host mask for a block with `host_len` host bits.
fn host_mask(host_len: u8) -> u128 {
    if host_len >= 128 {
        u128::MAX
    } else {
        (1u128 << host_len) - 1
    }
}

/// An IP block in CIDR notation, IPv4 or IPv6.
#[derive(Eq, Debug, Copy, Clone, Hash)]
pub struct Cidr {
    /// The block's address. Not required to be the network address;
    /// [`Cidr::network`] computes that.
    pub addr: IpAddr,
    /// The prefix length (0-32 for IPv4, 0-128 for IPv6).
    pub prefix: u8,
}

impl Cidr {
    /// Create a new [`Cidr`] from a CIDR string (e.g., "10.0.0.0/24").
    pub fn new(addr_cidr: &str) -> Result<Cidr, CidrError> {
        let addr_cidr = addr_cidr.trim();
        let parts: Vec<&str> = addr_cidr.split('/').collect();
        if parts.len() != 2 {
            return Err(CidrError::Format(addr_cidr.to_string()));
        }
        let addr: IpAddr = parts[0]
            .parse()
            .map_err(|_| CidrError::Address(parts[0].to_string()))?;
        let prefix: u8 = parts[1]
            .parse()
            .map_err(|_| CidrError::Format(addr_cidr.to_string()))?;
        Cidr::from_parts(addr, prefix)
    }

    /// Create a [`Cidr`] from an address and a prefix length.
    pub fn from_parts(addr: IpAddr, prefix: u8) -> Result<Cidr, CidrError> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(CidrError::PrefixTooLong { prefix, max });
        }
        Ok(Cidr { addr, prefix })
    }

    /// Maximum prefix length for this block's address family.
    pub fn max_prefix(&self) -> u8 {
        max_prefix(&self.addr)
    }

    fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    fn network_bits(&self) -> u128 {
        addr_bits(&self.addr) & !host_mask(self.max_prefix() - self.prefix)
    }

    fn last_bits(&self) -> u128 {
        self.network_bits() | host_mask(self.max_prefix() - self.prefix)
    }

    /// The network (base) address of the block.
    pub fn network(&self) -> IpAddr {
        bits_to_addr(self.network_bits(), self.is_v4())
    }

    /// The highest address of the block (the broadcast address for IPv4).
    pub fn last(&self) -> IpAddr {
        bits_to_addr(self.last_bits(), self.is_v4())
    }

    /// Number of addresses the block holds (`2^(max_prefix - prefix)`).
    ///
    /// Saturates at `u128::MAX` for an IPv6 /0 block.
    pub fn capacity(&self) -> u128 {
        let host_len = self.max_prefix() - self.prefix;
        if host_len >= 128 {
            u128::MAX
        } else {
            1u128 << host_len
        }
    }

    /// Whether `ip` falls inside this block. Always false across families.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if ip.is_ipv4() != self.is_v4() {
            return false;
        }
        let bits = addr_bits(ip);
        self.network_bits() <= bits && bits <= self.last_bits()
    }

    /// Whether two blocks share any address. Always false across families.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        if self.is_v4() != other.is_v4() {
            return false;
        }
        self.network_bits() <= other.last_bits() && other.network_bits() <= self.last_bits()
    }

    /// The address at `offset` from the block's base address.
    ///
    /// Fails with [`CidrError::OutOfRange`] past the block's last address.
    pub fn nth(&self, offset: u128) -> Result<IpAddr, CidrError> {
        let bits = self
            .network_bits()
            .checked_add(offset)
            .ok_or(CidrError::OutOfRange)?;
        if bits > self.last_bits() {
            return Err(CidrError::OutOfRange);
        }
        Ok(bits_to_addr(bits, self.is_v4()))
    }

    /// The block of the same prefix length immediately after this one.
    ///
    /// Fails with [`CidrError::OutOfRange`] at the end of the address space.
    pub fn next_block(&self) -> Result<Cidr, CidrError> {
        let bits = self
            .last_bits()
            .checked_add(1)
            .ok_or(CidrError::OutOfRange)?;
        if self.is_v4() && bits > u32::MAX as u128 {
            return Err(CidrError::OutOfRange);
        }
        Ok(Cidr {
            addr: bits_to_addr(bits, self.is_v4()),
            prefix: self.prefix,
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::new(s)
    }
}

impl Serialize for Cidr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D>(deserializer: D) -> Result<Cidr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Cidr::new(&s).map_err(|e| de::Error::custom(e.to_string()))
    }
}

impl PartialEq for Cidr {
    fn eq(&self, other: &Cidr) -> bool {
        self.addr == other.addr && self.prefix == other.prefix
    }
}

impl Ord for Cidr {
    fn cmp(&self, other: &Cidr) -> std::cmp::Ordering {
        (self.addr, self.prefix).cmp(&(other.addr, other.prefix))
    }
}

impl PartialOrd for Cidr {
    fn partial_cmp(&self, other: &Cidr) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
