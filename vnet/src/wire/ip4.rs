//! IPv4 header and address.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::BitOr;
use std::str::FromStr;

use super::checksum::{Checksum, checksum};
use super::{NetU16, PacketHeader, Protocol, Result, WireError, array, truncated};

/// Size of the IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv4 address, stored in wire order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    pub const UNSPECIFIED: Address = Address([0; 4]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Address([a, b, c, d])
    }

    /// The four bytes as one opaque word, for equality and zero tests.
    #[inline]
    pub fn as_u32(self) -> u32 {
        u32::from_ne_bytes(self.0)
    }

    #[inline]
    pub fn from_u32(x: u32) -> Self {
        Address(x.to_ne_bytes())
    }

    /// Address as a host-order integer (`10.0.0.1` is `0x0a000001`).
    #[inline]
    pub fn to_host_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub fn from_host_u32(x: u32) -> Self {
        Address(x.to_be_bytes())
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.as_u32() == 0
    }

    /// Add `x` to the address as a big-endian number, carrying between
    /// bytes. Carry out of the first byte is lost.
    pub fn add(&mut self, x: u64) {
        let mut carry = x;
        for byte in self.0.iter_mut().rev() {
            let sum = u64::from(*byte) + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
    }

    /// Compare for sorting: -1, 0 or 1.
    ///
    /// The difference is taken in 64-bit arithmetic so it cannot wrap.
    pub fn diff(&self, other: &Address) -> i32 {
        let d = i64::from(self.to_host_u32()) - i64::from(other.to_host_u32());
        d.signum() as i32
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.diff(other).cmp(&0)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map(Address::from)
            .map_err(|_| WireError::InvalidText {
                what: "IPv4 address",
                text: s.to_string(),
            })
    }
}

impl From<Ipv4Addr> for Address {
    fn from(a: Ipv4Addr) -> Self {
        Address(a.octets())
    }
}

impl From<Address> for Ipv4Addr {
    fn from(a: Address) -> Self {
        Ipv4Addr::from(a.0)
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Flag bits of the flags/fragment-offset field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct HeaderFlags(u16);

impl HeaderFlags {
    pub const NONE: HeaderFlags = HeaderFlags(0);
    pub const MORE_FRAGMENTS: HeaderFlags = HeaderFlags(1 << 13);
    pub const DONT_FRAGMENT: HeaderFlags = HeaderFlags(1 << 14);
    pub const CONGESTION: HeaderFlags = HeaderFlags(1 << 15);

    const MASK: u16 = 0xe000;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeaderFlags {
    type Output = HeaderFlags;

    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | rhs.0)
    }
}

/// IPv4 header.
///
/// Options, if present, are not kept: `header_len()` reports them so that
/// callers find the payload, but `write` refuses headers with options.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Ipv4Header {
    /// Version in the high nibble, header length in 32-bit words in the low.
    pub version_ihl: u8,
    pub tos: u8,
    /// Total packet length including this header.
    pub length: NetU16,
    pub fragment_id: NetU16,
    /// 3 flag bits and 13 bits of fragment offset in 8-byte units.
    pub flags_and_fragment_offset: NetU16,
    pub ttl: u8,
    pub protocol: Protocol,
    pub checksum: NetU16,
    pub src: Address,
    pub dst: Address,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Ipv4Header {
            version_ihl: 0x45,
            tos: 0,
            length: NetU16::ZERO,
            fragment_id: NetU16::ZERO,
            flags_and_fragment_offset: NetU16::ZERO,
            ttl: 64,
            protocol: Protocol::default(),
            checksum: NetU16::ZERO,
            src: Address::UNSPECIFIED,
            dst: Address::UNSPECIFIED,
        }
    }
}

impl Ipv4Header {
    pub fn new(src: Address, dst: Address, protocol: Protocol) -> Self {
        Ipv4Header {
            src,
            dst,
            protocol,
            ..Default::default()
        }
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in 32-bit words.
    #[inline]
    pub fn ihl(&self) -> u8 {
        self.version_ihl & 0xf
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        usize::from(self.length.to_host())
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags_and_fragment_offset.to_host() & HeaderFlags::MASK)
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.flags_and_fragment_offset.to_host() & !HeaderFlags::MASK
    }

    pub fn set_flags(&mut self, flags: HeaderFlags) {
        let offset = self.fragment_offset();
        self.flags_and_fragment_offset
            .set((flags.bits() & HeaderFlags::MASK) | offset);
    }

    /// Whether this is any fragment other than a complete datagram.
    pub fn is_fragment(&self) -> bool {
        self.flags().contains(HeaderFlags::MORE_FRAGMENTS) || self.fragment_offset() != 0
    }

    /// Fixed 20-byte wire form.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut b = [0u8; IPV4_HEADER_LEN];
        b[0] = self.version_ihl;
        b[1] = self.tos;
        b[2..4].copy_from_slice(&self.length.to_wire());
        b[4..6].copy_from_slice(&self.fragment_id.to_wire());
        b[6..8].copy_from_slice(&self.flags_and_fragment_offset.to_wire());
        b[8] = self.ttl;
        b[9] = self.protocol.0;
        b[10..12].copy_from_slice(&self.checksum.to_wire());
        b[12..16].copy_from_slice(&self.src.0);
        b[16..20].copy_from_slice(&self.dst.0);
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        Ipv4Header {
            version_ihl: b[0],
            tos: b[1],
            length: NetU16::from_wire(array(b, 2)),
            fragment_id: NetU16::from_wire(array(b, 4)),
            flags_and_fragment_offset: NetU16::from_wire(array(b, 6)),
            ttl: b[8],
            protocol: Protocol(b[9]),
            checksum: NetU16::from_wire(array(b, 10)),
            src: Address(array(b, 12)),
            dst: Address(array(b, 16)),
        }
    }

    /// Checksum of the fixed header, summed as two 64-bit words and one
    /// 32-bit word.
    fn fast_checksum(b: &[u8; IPV4_HEADER_LEN]) -> NetU16 {
        Checksum(u64::from_ne_bytes(array(b, 0)))
            .add_with_carry(Checksum(u64::from_ne_bytes(array(b, 8))))
            .add_with_carry(Checksum(u64::from(u32::from_ne_bytes(array(b, 16)))))
            .finish()
    }

    /// Checksum this header should carry, ignoring the current field.
    pub fn compute_checksum(&self) -> NetU16 {
        let mut tmp = *self;
        tmp.checksum = NetU16::ZERO;
        Self::fast_checksum(&tmp.to_bytes())
    }

    /// Verify the checksum of the header at the front of `bytes`, options
    /// included.
    pub fn verify_checksum(bytes: &[u8]) -> bool {
        let Some(&first) = bytes.first() else {
            return false;
        };
        let len = usize::from(first & 0xf) * 4;
        len >= IPV4_HEADER_LEN && bytes.len() >= len && checksum(&bytes[..len]) == NetU16::ZERO
    }
}

impl PacketHeader for Ipv4Header {
    fn header_len(&self) -> usize {
        usize::from(self.ihl()) * 4
    }

    fn write(&mut self, dest: &mut [u8]) -> Result<()> {
        if self.ihl() != 5 {
            return Err(WireError::OptionsUnsupported);
        }
        if dest.len() < IPV4_HEADER_LEN {
            return Err(truncated("IPv4 header", IPV4_HEADER_LEN, dest.len()));
        }
        let len = u16::try_from(dest.len()).map_err(|_| WireError::TooLong {
            what: "IPv4 packet",
            len: dest.len(),
        })?;

        self.length.set(len);
        self.checksum = NetU16::ZERO;
        self.checksum = Self::fast_checksum(&self.to_bytes());
        dest[..IPV4_HEADER_LEN].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Parse the fixed header. Options, if the header length says there are
    /// any, are skipped: they are not kept in the returned header and the
    /// payload starts after them. [`PacketHeader::header_len`] still reports
    /// the full length, and writing such a header back fails with
    /// [`WireError::OptionsUnsupported`].
    fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(truncated("IPv4 header", IPV4_HEADER_LEN, bytes.len()));
        }
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(WireError::BadVersion(version));
        }
        let ihl = bytes[0] & 0xf;
        if ihl < 5 {
            return Err(WireError::BadHeaderLength(ihl));
        }
        let len = usize::from(ihl) * 4;
        if bytes.len() < len {
            return Err(truncated("IPv4 header", len, bytes.len()));
        }
        Ok((Self::from_bytes(bytes), &bytes[len..]))
    }
}
