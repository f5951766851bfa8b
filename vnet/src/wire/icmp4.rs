//! ICMPv4 header prefix: type, code, checksum.

use std::fmt;

use super::checksum::checksum;
use super::{NetU16, PacketHeader, Result, array, truncated};

pub const ICMP4_HEADER_LEN: usize = 4;

/// ICMPv4 message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Icmp4Type(pub u8);

impl Icmp4Type {
    pub const ECHO_REPLY: Icmp4Type = Icmp4Type(0);
    pub const DEST_UNREACHABLE: Icmp4Type = Icmp4Type(3);
    pub const REDIRECT: Icmp4Type = Icmp4Type(5);
    pub const ECHO_REQUEST: Icmp4Type = Icmp4Type(8);
    pub const TIME_EXCEEDED: Icmp4Type = Icmp4Type(11);
    pub const PARAMETER_PROBLEM: Icmp4Type = Icmp4Type(12);
}

impl fmt::Display for Icmp4Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::ECHO_REPLY => "echo-reply",
            Self::DEST_UNREACHABLE => "destination-unreachable",
            Self::REDIRECT => "redirect",
            Self::ECHO_REQUEST => "echo-request",
            Self::TIME_EXCEEDED => "time-exceeded",
            Self::PARAMETER_PROBLEM => "parameter-problem",
            Icmp4Type(t) => return write!(f, "type-{t}"),
        };
        f.write_str(name)
    }
}

impl fmt::Debug for Icmp4Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Icmp4Header {
    pub kind: Icmp4Type,
    pub code: u8,
    pub checksum: NetU16,
}

impl Icmp4Header {
    pub fn new(kind: Icmp4Type, code: u8) -> Self {
        Icmp4Header {
            kind,
            code,
            checksum: NetU16::ZERO,
        }
    }

    /// Verify the checksum over a whole ICMP message.
    pub fn verify_checksum(message: &[u8]) -> bool {
        message.len() >= ICMP4_HEADER_LEN && checksum(message) == NetU16::ZERO
    }
}

impl PacketHeader for Icmp4Header {
    fn header_len(&self) -> usize {
        ICMP4_HEADER_LEN
    }

    /// ICMP has no length field; the checksum covers all of `dest`.
    fn write(&mut self, dest: &mut [u8]) -> Result<()> {
        if dest.len() < ICMP4_HEADER_LEN {
            return Err(truncated("ICMP header", ICMP4_HEADER_LEN, dest.len()));
        }
        dest[0] = self.kind.0;
        dest[1] = self.code;
        dest[2..4].copy_from_slice(&[0, 0]);
        self.checksum = checksum(dest);
        dest[2..4].copy_from_slice(&self.checksum.to_wire());
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < ICMP4_HEADER_LEN {
            return Err(truncated("ICMP header", ICMP4_HEADER_LEN, bytes.len()));
        }
        let h = Icmp4Header {
            kind: Icmp4Type(bytes[0]),
            code: bytes[1],
            checksum: NetU16::from_wire(array(bytes, 2)),
        };
        Ok((h, &bytes[ICMP4_HEADER_LEN..]))
    }
}
