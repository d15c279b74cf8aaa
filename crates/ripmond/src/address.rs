//! IPv4 address, mask and prefix helpers.
//!
//! RIP carries addresses and masks as raw big-endian 32-bit words and the
//! routing trie walks them one bit at a time, so the core works on `u32`.
//! These helpers convert between that form and dotted-decimal text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Error type for address parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid IPv4 address format: {0}")]
    InvalidAddress(String),

    #[error("invalid subnet mask: {0}")]
    InvalidMask(String),

    #[error("invalid IPv4 prefix format: {0}")]
    InvalidPrefix(String),
}

/// Formats a 32-bit address as dotted-decimal text.
pub fn to_dotted(addr: u32) -> String {
    Ipv4Addr::from(addr).to_string()
}

/// Parses dotted-decimal text into a 32-bit address.
pub fn parse_dotted(s: &str) -> Result<u32, ParseError> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| ParseError::InvalidAddress(s.to_string()))
}

/// Number of set bits in a mask (the prefix length of a contiguous mask).
#[inline]
pub const fn mask_len(mask: u32) -> u32 {
    mask.count_ones()
}

/// Number of trie levels consumed when walking `mask` high bit first until
/// no set bit remains.
///
/// Equal to [`mask_len`] for contiguous masks.
#[inline]
pub const fn walk_depth(mask: u32) -> u32 {
    32 - mask.trailing_zeros()
}

/// Builds the contiguous mask for a prefix length (clamped to 32).
#[inline]
pub const fn mask_from_len(len: u32) -> u32 {
    if len == 0 {
        0
    } else if len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - len)
    }
}

/// Returns true if the mask is a run of ones followed by a run of zeros.
#[inline]
pub const fn is_contiguous(mask: u32) -> bool {
    mask.leading_ones() + mask.trailing_zeros() == 32
}

/// An IPv4 network prefix with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    network: u32,
    len: u8,
}

impl Ipv4Prefix {
    /// The default route, 0.0.0.0/0.
    pub const DEFAULT: Self = Ipv4Prefix { network: 0, len: 0 };

    /// Creates a prefix, clearing any host bits of `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` exceeds 32.
    pub fn new(addr: u32, len: u8) -> Result<Self, ParseError> {
        if len > 32 {
            return Err(ParseError::InvalidPrefix(format!(
                "prefix length {} exceeds maximum 32",
                len
            )));
        }
        Ok(Self::masked(addr, len))
    }

    /// Creates a prefix from an address and a contiguous subnet mask.
    pub fn from_addr_mask(addr: u32, mask: u32) -> Result<Self, ParseError> {
        if !is_contiguous(mask) {
            return Err(ParseError::InvalidMask(to_dotted(mask)));
        }
        Self::new(addr, mask_len(mask) as u8)
    }

    /// Parses the `address mask` pair form used on the command line,
    /// e.g. `192.0.2.0 255.255.255.0`.
    pub fn parse_pair(addr: &str, mask: &str) -> Result<Self, ParseError> {
        let mask = parse_dotted(mask).map_err(|_| ParseError::InvalidMask(mask.to_string()))?;
        Self::from_addr_mask(parse_dotted(addr)?, mask)
    }

    pub(crate) const fn masked(addr: u32, len: u8) -> Self {
        let len = if len > 32 { 32 } else { len };
        Ipv4Prefix {
            network: addr & mask_from_len(len as u32),
            len,
        }
    }

    /// Network address as a 32-bit integer.
    pub const fn network(&self) -> u32 {
        self.network
    }

    /// Prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Subnet mask as a 32-bit integer.
    pub const fn mask(&self) -> u32 {
        mask_from_len(self.len as u32)
    }

    /// Number of host bits (32 - prefix length).
    pub const fn host_bits(&self) -> u32 {
        32 - self.len as u32
    }

    /// Number of addresses covered by the prefix.
    pub const fn size(&self) -> u64 {
        1u64 << self.host_bits()
    }

    /// Returns true if `addr` falls inside this prefix.
    pub const fn contains(&self, addr: u32) -> bool {
        addr & self.mask() == self.network
    }

    /// Returns true if this is the default route.
    pub const fn is_default(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ParseError;

    /// Accepts `a.b.c.d/len` or a bare address (treated as a /32).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((addr_str, len_str)) => {
                let addr = parse_dotted(addr_str)?;
                let len: u8 = len_str
                    .parse()
                    .map_err(|_| ParseError::InvalidPrefix(s.to_string()))?;
                Self::new(addr, len)
            }
            None => Self::new(parse_dotted(s)?, 32),
        }
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(prefix: Ipv4Prefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dotted_conversion() {
        assert_eq!(to_dotted(0), "0.0.0.0");
        assert_eq!(to_dotted(u32::MAX), "255.255.255.255");
        assert_eq!(to_dotted(0xC0A8_0001), "192.168.0.1");
        assert_eq!(parse_dotted("192.168.0.1").unwrap(), 0xC0A8_0001);
    }

    #[test]
    fn test_parse_dotted_rejects_garbage() {
        assert!(parse_dotted("192.168.0").is_err());
        assert!(parse_dotted("192.168.0.256").is_err());
        assert!(parse_dotted("ten.0.0.1").is_err());
    }

    #[test]
    fn test_mask_helpers() {
        assert_eq!(mask_len(0xFFFF_FF00), 24);
        assert_eq!(mask_len(0), 0);
        assert_eq!(mask_from_len(24), 0xFFFF_FF00);
        assert_eq!(mask_from_len(0), 0);
        assert_eq!(mask_from_len(32), u32::MAX);
        assert_eq!(walk_depth(0xFF00_0000), 8);
        assert_eq!(walk_depth(0), 0);
        assert_eq!(walk_depth(u32::MAX), 32);
    }

    #[test]
    fn test_walk_depth_of_non_contiguous_mask() {
        // consumed up to and including the lowest set bit
        assert_eq!(walk_depth(0xFF00_FF00), 24);
        assert!(!is_contiguous(0xFF00_FF00));
        assert!(is_contiguous(0xFFFF_0000));
        assert!(is_contiguous(0));
        assert!(is_contiguous(u32::MAX));
    }

    #[test]
    fn test_prefix_parse_and_display() {
        let prefix: Ipv4Prefix = "10.16.0.0/16".parse().unwrap();
        assert_eq!(prefix.prefix_len(), 16);
        assert_eq!(prefix.network(), 0x0A10_0000);
        assert_eq!(prefix.to_string(), "10.16.0.0/16");
    }

    #[test]
    fn test_prefix_clears_host_bits() {
        let prefix: Ipv4Prefix = "192.168.1.77/24".parse().unwrap();
        assert_eq!(prefix.to_string(), "192.168.1.0/24");
        assert!(prefix.contains(parse_dotted("192.168.1.200").unwrap()));
        assert!(!prefix.contains(parse_dotted("192.168.2.1").unwrap()));
    }

    #[test]
    fn test_prefix_pair_form() {
        let prefix = Ipv4Prefix::parse_pair("198.51.100.0", "255.255.255.0").unwrap();
        assert_eq!(prefix.to_string(), "198.51.100.0/24");
        assert_eq!(prefix.size(), 256);
        assert!(Ipv4Prefix::parse_pair("198.51.100.0", "255.0.255.0").is_err());
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<Ipv4Prefix>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn test_bare_address_is_host_route() {
        let prefix: Ipv4Prefix = "203.0.113.9".parse().unwrap();
        assert_eq!(prefix.prefix_len(), 32);
        assert_eq!(prefix.host_bits(), 0);
        assert!(Ipv4Prefix::DEFAULT.is_default());
    }
}
