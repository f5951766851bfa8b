//! Flow keys.

use std::fmt;

use crate::wire::{Address, Ipv4Header, Protocol};

/// 5-tuple-like classification key of an IPv4 packet.
///
/// Ports are in host order. For ICMP `extra` holds the message type and the
/// ports are zero; for protocols other than ICMP, TCP and UDP only the
/// protocol and addresses are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Flow {
    pub protocol: Protocol,
    pub extra: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src: Address,
    pub dst: Address,
}

impl Flow {
    /// Extract the flow of a packet from its header and the payload that
    /// follows it.
    ///
    /// Transport fields that are not present (short payload, or a fragment
    /// other than the first) are left zero.
    pub fn extract(h: &Ipv4Header, payload: &[u8]) -> Flow {
        let mut f = Flow {
            protocol: h.protocol,
            src: h.src,
            dst: h.dst,
            ..Default::default()
        };
        if h.fragment_offset() != 0 {
            return f;
        }
        match h.protocol {
            Protocol::ICMP => {
                if let Some(&kind) = payload.first() {
                    f.extra = kind;
                }
            }
            // TCP and UDP share the port layout.
            Protocol::TCP | Protocol::UDP => {
                if let [s0, s1, d0, d1, ..] = *payload {
                    f.src_port = u16::from_be_bytes([s0, s1]);
                    f.dst_port = u16::from_be_bytes([d0, d1]);
                }
            }
            _ => {}
        }
        f
    }

    /// The flow of reply packets: addresses and ports swapped.
    pub fn reverse(&self) -> Flow {
        Flow {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..*self
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::TCP | Protocol::UDP => write!(
                f,
                "{} {}:{} -> {}:{}",
                self.protocol, self.src, self.src_port, self.dst, self.dst_port
            ),
            Protocol::ICMP => write!(
                f,
                "{} {} -> {} type {}",
                self.protocol, self.src, self.dst, self.extra
            ),
            _ => write!(f, "{} {} -> {}", self.protocol, self.src, self.dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketHeader;

    fn header(protocol: Protocol) -> Ipv4Header {
        Ipv4Header::new(Address::new(10, 0, 0, 1), Address::new(10, 0, 0, 2), protocol)
    }

    #[test]
    fn test_udp_ports() {
        let f = Flow::extract(&header(Protocol::UDP), &[0x12, 0xb5, 0x00, 0x35, 0, 8, 0, 0]);
        assert_eq!(f.src_port, 4789);
        assert_eq!(f.dst_port, 53);
        assert_eq!(f.extra, 0);
        assert_eq!(f.to_string(), "udp 10.0.0.1:4789 -> 10.0.0.2:53");
    }

    #[test]
    fn test_tcp_shares_port_layout() {
        let f = Flow::extract(&header(Protocol::TCP), &[0, 80, 0xc0, 0x00]);
        assert_eq!((f.src_port, f.dst_port), (80, 0xc000));
    }

    #[test]
    fn test_icmp_type_in_extra() {
        let f = Flow::extract(&header(Protocol::ICMP), &[8, 0, 0xf7, 0xff]);
        assert_eq!(f.extra, 8);
        assert_eq!((f.src_port, f.dst_port), (0, 0));
    }

    #[test]
    fn test_other_protocol_addresses_only() {
        let f = Flow::extract(&header(Protocol::GRE), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(f.protocol, Protocol::GRE);
        assert_eq!((f.extra, f.src_port, f.dst_port), (0, 0, 0));
        assert_eq!(f.src, Address::new(10, 0, 0, 1));
    }

    #[test]
    fn test_short_or_fragmented_payload_leaves_zero() {
        assert_eq!(Flow::extract(&header(Protocol::UDP), &[0, 1, 0]).src_port, 0);
        assert_eq!(Flow::extract(&header(Protocol::ICMP), &[]).extra, 0);

        let mut h = header(Protocol::UDP);
        h.flags_and_fragment_offset.set(100);
        assert_eq!(Flow::extract(&h, &[0, 1, 0, 2]).dst_port, 0);
    }

    #[test]
    fn test_reverse_is_an_involution() {
        let mut buf = [0u8; 28];
        let mut h = header(Protocol::UDP);
        h.write(&mut buf).unwrap();
        buf[20..24].copy_from_slice(&[0x04, 0x00, 0x00, 0x35]);
        let (h, payload) = Ipv4Header::parse(&buf).unwrap();

        let f = Flow::extract(&h, payload);
        let r = f.reverse();
        assert_eq!(r.src, f.dst);
        assert_eq!(r.dst_port, f.src_port);
        assert_eq!(r.extra, f.extra);
        assert_eq!(r.reverse(), f);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn any_flow() -> impl Strategy<Value = Flow> {
            (
                any::<u8>(),
                any::<u8>(),
                any::<u16>(),
                any::<u16>(),
                any::<[u8; 4]>(),
                any::<[u8; 4]>(),
            )
                .prop_map(|(protocol, extra, src_port, dst_port, src, dst)| Flow {
                    protocol: Protocol(protocol),
                    extra,
                    src_port,
                    dst_port,
                    src: Address(src),
                    dst: Address(dst),
                })
        }

        proptest! {
            #[test]
            fn prop_reverse_twice_is_identity(f in any_flow()) {
                prop_assert_eq!(f.reverse().reverse(), f);
            }

            #[test]
            fn prop_reverse_swaps_endpoints_only(f in any_flow()) {
                let r = f.reverse();
                prop_assert_eq!((r.src, r.src_port), (f.dst, f.dst_port));
                prop_assert_eq!((r.dst, r.dst_port), (f.src, f.src_port));
                prop_assert_eq!((r.protocol, r.extra), (f.protocol, f.extra));
            }
        }
    }
}
