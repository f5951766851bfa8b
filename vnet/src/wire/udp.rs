//! UDP header.

use std::fmt;
use std::str::FromStr;

use super::checksum::Checksum;
use super::{Address, NetU16, PacketHeader, Protocol, Result, WireError, array, truncated};

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct UdpHeader {
    pub src_port: NetU16,
    pub dst_port: NetU16,
    /// Length of header plus payload.
    pub length: NetU16,
    pub checksum: NetU16,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        UdpHeader {
            src_port: NetU16::from_host(src_port),
            dst_port: NetU16::from_host(dst_port),
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut b = [0u8; UDP_HEADER_LEN];
        b[0..2].copy_from_slice(&self.src_port.to_wire());
        b[2..4].copy_from_slice(&self.dst_port.to_wire());
        b[4..6].copy_from_slice(&self.length.to_wire());
        b[6..8].copy_from_slice(&self.checksum.to_wire());
        b
    }

    fn pseudo_header_sum(src: Address, dst: Address, len: u16) -> Checksum {
        Checksum::default()
            .add_bytes(&src.0)
            .add_bytes(&dst.0)
            .add_bytes(&[0, Protocol::UDP.0])
            .add_bytes(&len.to_be_bytes())
    }

    /// Like [`PacketHeader::write`], but also fills in the checksum over the
    /// IPv4 pseudo-header and `dest` (header plus payload).
    pub fn write_with_checksum(
        &mut self,
        dest: &mut [u8],
        src: Address,
        dst: Address,
    ) -> Result<()> {
        self.write(dest)?;
        let sum = Self::pseudo_header_sum(src, dst, self.length.to_host())
            .add_bytes(dest)
            .finish();
        // Zero means "no checksum"; its one's-complement twin is sent instead.
        self.checksum = if sum == NetU16::ZERO {
            NetU16::from_host(0xffff)
        } else {
            sum
        };
        dest[6..8].copy_from_slice(&self.checksum.to_wire());
        Ok(())
    }

    /// Verify the checksum of `segment` (header plus payload). A zero
    /// checksum field means the sender did not compute one.
    pub fn verify_checksum(segment: &[u8], src: Address, dst: Address) -> bool {
        if segment.len() < UDP_HEADER_LEN || segment.len() > usize::from(u16::MAX) {
            return false;
        }
        if segment[6..8] == [0, 0] {
            return true;
        }
        Self::pseudo_header_sum(src, dst, segment.len() as u16)
            .add_bytes(segment)
            .finish()
            == NetU16::ZERO
    }
}

impl PacketHeader for UdpHeader {
    fn header_len(&self) -> usize {
        UDP_HEADER_LEN
    }

    fn write(&mut self, dest: &mut [u8]) -> Result<()> {
        if dest.len() < UDP_HEADER_LEN {
            return Err(truncated("UDP header", UDP_HEADER_LEN, dest.len()));
        }
        let len = u16::try_from(dest.len()).map_err(|_| WireError::TooLong {
            what: "UDP datagram",
            len: dest.len(),
        })?;
        self.length.set(len);
        self.checksum = NetU16::ZERO;
        dest[..UDP_HEADER_LEN].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < UDP_HEADER_LEN {
            return Err(truncated("UDP header", UDP_HEADER_LEN, bytes.len()));
        }
        let h = UdpHeader {
            src_port: NetU16::from_wire(array(bytes, 0)),
            dst_port: NetU16::from_wire(array(bytes, 2)),
            length: NetU16::from_wire(array(bytes, 4)),
            checksum: NetU16::from_wire(array(bytes, 6)),
        };
        Ok((h, &bytes[UDP_HEADER_LEN..]))
    }
}

impl fmt::Display for UdpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x} -> 0x{:x}",
            self.src_port.to_host(),
            self.dst_port.to_host()
        )
    }
}

fn parse_port(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Parses `<src> -> <dst>`, each port decimal or `0x` hex.
impl FromStr for UdpHeader {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WireError::InvalidText {
            what: "UDP ports",
            text: s.to_string(),
        };
        let (src, dst) = s.split_once("->").ok_or_else(invalid)?;
        let src = parse_port(src).ok_or_else(invalid)?;
        let dst = parse_port(dst).ok_or_else(invalid)?;
        Ok(UdpHeader::new(src, dst))
    }
}
