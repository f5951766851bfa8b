//! Wire-format header codecs.
//!
//! Headers are parsed out of bounded byte slices into plain structs and
//! written back with explicit length checks. Multi-byte fields keep their
//! wire (big-endian) representation in [`NetU16`]/[`NetU32`]; accessors
//! convert to host order.

mod checksum;
mod icmp4;
mod ip4;
mod udp;

pub use checksum::{Checksum, checksum};
pub use icmp4::{ICMP4_HEADER_LEN, Icmp4Header, Icmp4Type};
pub use ip4::{Address, HeaderFlags, IPV4_HEADER_LEN, Ipv4Header};
pub use udp::{UDP_HEADER_LEN, UdpHeader};

use std::fmt;

use thiserror::Error;

/// Header codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{what} truncated: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("bad IPv4 header length: {0} words")]
    BadHeaderLength(u8),

    #[error("bad IP version {0}")]
    BadVersion(u8),

    #[error("{what} too long: {len} bytes")]
    TooLong { what: &'static str, len: usize },

    #[error("writing IPv4 options is not supported")]
    OptionsUnsupported,

    #[error("invalid {what}: {text:?}")]
    InvalidText { what: &'static str, text: String },
}

pub type Result<T> = std::result::Result<T, WireError>;

pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> WireError {
    WireError::Truncated {
        what,
        needed,
        available,
    }
}

/// Common contract of every header codec.
pub trait PacketHeader: Sized {
    /// Bytes this header occupies on the wire.
    fn header_len(&self) -> usize;

    /// Serialize into the front of `dest`.
    ///
    /// `dest` spans the header and everything it covers: the length field is
    /// set to `dest.len()`, the checksum is recomputed.
    fn write(&mut self, dest: &mut [u8]) -> Result<()>;

    /// Parse the header at the front of `bytes`, returning it and the payload.
    fn parse(bytes: &[u8]) -> Result<(Self, &[u8])>;
}

/// 16-bit value stored in network byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetU16([u8; 2]);

impl NetU16 {
    pub const ZERO: NetU16 = NetU16([0; 2]);

    #[inline]
    pub const fn from_host(v: u16) -> Self {
        NetU16(v.to_be_bytes())
    }

    #[inline]
    pub const fn to_host(self) -> u16 {
        u16::from_be_bytes(self.0)
    }

    #[inline]
    pub const fn from_wire(bytes: [u8; 2]) -> Self {
        NetU16(bytes)
    }

    #[inline]
    pub const fn to_wire(self) -> [u8; 2] {
        self.0
    }

    /// Store a host-order value.
    #[inline]
    pub fn set(&mut self, v: u16) {
        *self = Self::from_host(v);
    }
}

impl fmt::Debug for NetU16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.to_host())
    }
}

/// 32-bit value stored in network byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetU32([u8; 4]);

impl NetU32 {
    #[inline]
    pub const fn from_host(v: u32) -> Self {
        NetU32(v.to_be_bytes())
    }

    #[inline]
    pub const fn to_host(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub const fn from_wire(bytes: [u8; 4]) -> Self {
        NetU32(bytes)
    }

    #[inline]
    pub const fn to_wire(self) -> [u8; 4] {
        self.0
    }

    #[inline]
    pub fn set(&mut self, v: u32) {
        *self = Self::from_host(v);
    }
}

impl fmt::Debug for NetU32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.to_host())
    }
}

/// IP protocol number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const ICMP: Protocol = Protocol(1);
    pub const IGMP: Protocol = Protocol(2);
    pub const IP_IN_IP: Protocol = Protocol(4);
    pub const TCP: Protocol = Protocol(6);
    pub const UDP: Protocol = Protocol(17);
    pub const IPV6: Protocol = Protocol(41);
    pub const GRE: Protocol = Protocol(47);
    pub const ESP: Protocol = Protocol(50);
    pub const ICMPV6: Protocol = Protocol(58);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::ICMP => "icmp",
            Self::IGMP => "igmp",
            Self::IP_IN_IP => "ip-in-ip",
            Self::TCP => "tcp",
            Self::UDP => "udp",
            Self::IPV6 => "ipv6",
            Self::GRE => "gre",
            Self::ESP => "esp",
            Self::ICMPV6 => "icmpv6",
            _ => return None,
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Copy `N` bytes starting at `at`. Callers have checked the length.
#[inline]
pub(crate) fn array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}
