//! Reference packets built with smoltcp.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

pub const IP_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;

fn addr(a: [u8; 4]) -> Ipv4Address {
    Ipv4Address::new(a[0], a[1], a[2], a[3])
}

fn ipv4(src: [u8; 4], dst: [u8; 4], proto: IpProtocol, payload_len: usize, ttl: u8) -> Vec<u8> {
    let mut packet = vec![0u8; IP_HDR_SIZE + payload_len];
    let repr = Ipv4Repr {
        src_addr: addr(src),
        dst_addr: addr(dst),
        next_header: proto,
        payload_len,
        hop_limit: ttl,
    };
    repr.emit(
        &mut Ipv4Packet::new_unchecked(&mut packet[..]),
        &ChecksumCapabilities::default(),
    );
    packet
}

/// IPv4/UDP packet with valid checksums.
pub fn udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8], ttl: u8) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut packet = ipv4(src, dst, IpProtocol::Udp, udp_len, ttl);
    let repr = UdpRepr {
        src_port: sport,
        dst_port: dport,
    };
    repr.emit(
        &mut UdpPacket::new_unchecked(&mut packet[IP_HDR_SIZE..]),
        &addr(src).into(),
        &addr(dst).into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    packet
}

/// IPv4/ICMP echo request with valid checksums.
pub fn icmp_echo(src: [u8; 4], dst: [u8; 4], ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };
    let mut packet = ipv4(src, dst, IpProtocol::Icmp, repr.buffer_len(), 64);
    repr.emit(
        &mut Icmpv4Packet::new_unchecked(&mut packet[IP_HDR_SIZE..]),
        &ChecksumCapabilities::default(),
    );
    packet
}

/// Whether smoltcp accepts the IPv4 header checksum of `packet`.
pub fn ipv4_checksum_ok(packet: &[u8]) -> bool {
    Ipv4Packet::new_checked(packet).is_ok_and(|p| p.verify_checksum())
}

/// Whether smoltcp accepts the UDP checksum of an IPv4/UDP `packet`.
pub fn udp_checksum_ok(packet: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::new_checked(packet) else {
        return false;
    };
    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
        return false;
    };
    udp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into())
}
