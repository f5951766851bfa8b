//! Internet checksum (RFC 1071).
//!
//! The one's-complement sum is independent of byte order as long as the words
//! are read and the result stored in the same order, so words are read in
//! native order, 64 bits at a time, and the folded result is stored back
//! natively.

use super::NetU16;

/// Running one's-complement sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(pub u64);

impl Checksum {
    /// Add with end-around carry.
    #[inline]
    pub fn add_with_carry(self, other: Checksum) -> Checksum {
        let (sum, carry) = self.0.overflowing_add(other.0);
        Checksum(sum.wrapping_add(u64::from(carry)))
    }

    /// Fold the 64-bit sum down to 16 bits, keeping every carry.
    pub fn fold(self) -> u16 {
        let mut x = self.0;
        x = (x & 0xffff_ffff) + (x >> 32);
        x = (x & 0xffff_ffff) + (x >> 32);
        while x > 0xffff {
            x = (x & 0xffff) + (x >> 16);
        }
        x as u16
    }

    /// Add `bytes` to the sum. `bytes` must start on a 16-bit boundary of the
    /// checksummed data; an odd trailing byte is padded with zero.
    pub fn add_bytes(self, bytes: &[u8]) -> Checksum {
        let mut c = self;
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            c = c.add_with_carry(Checksum(u64::from_ne_bytes(super::array(chunk, 0))));
        }

        let mut rest = chunks.remainder();
        if rest.len() >= 4 {
            c = c.add_with_carry(Checksum(u64::from(u32::from_ne_bytes(super::array(rest, 0)))));
            rest = &rest[4..];
        }
        if rest.len() >= 2 {
            c = c.add_with_carry(Checksum(u64::from(u16::from_ne_bytes(super::array(rest, 0)))));
            rest = &rest[2..];
        }
        if let [last] = rest {
            c = c.add_with_carry(Checksum(u64::from(u16::from_ne_bytes([*last, 0]))));
        }
        c
    }

    /// Complemented 16-bit checksum, ready to store in a header.
    #[inline]
    pub fn finish(self) -> NetU16 {
        NetU16::from_wire((!self.fold()).to_ne_bytes())
    }
}

/// Checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> NetU16 {
    Checksum::default().add_bytes(bytes).finish()
}
