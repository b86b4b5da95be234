//! Parsing of sampled packet headers (sFlow raw header records).

use sflow_parser::models::HeaderProtocol;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const ETYPE_IPV4: u16 = 0x0800;
const ETYPE_IPV6: u16 = 0x86dd;
const ETYPE_VLAN: u16 = 0x8100;
const ETYPE_QINQ: u16 = 0x88a8;
const ETYPE_MPLS_UNICAST: u16 = 0x8847;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampledHeader {
    pub(crate) src_addr: IpAddr,
    pub(crate) dst_addr: IpAddr,
    pub(crate) protocol: u8,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    /// Length of the IP packet as stated by its own header.
    pub(crate) ip_length: u64,
}

/// Other link types (PPP, FDDI, ...) are not decoded.
pub(crate) fn parse_sampled_header(protocol: &HeaderProtocol, data: &[u8]) -> Option<SampledHeader> {
    match protocol {
        HeaderProtocol::EthernetIso88023 => parse_ethernet_frame(data),
        HeaderProtocol::Ipv4 => parse_ipv4_packet(data),
        HeaderProtocol::Ipv6 => parse_ipv6_packet(data),
        _ => None,
    }
}

fn parse_ethernet_frame(data: &[u8]) -> Option<SampledHeader> {
    if data.len() < 14 {
        return None;
    }

    let mut etype = u16::from_be_bytes([data[12], data[13]]);
    let mut cursor = &data[14..];

    while etype == ETYPE_VLAN || etype == ETYPE_QINQ {
        if cursor.len() < 4 {
            return None;
        }
        etype = u16::from_be_bytes([cursor[2], cursor[3]]);
        cursor = &cursor[4..];
    }

    if etype == ETYPE_MPLS_UNICAST {
        loop {
            if cursor.len() < 4 {
                return None;
            }
            let bottom = cursor[2] & 0x01;
            cursor = &cursor[4..];
            if bottom == 1 {
                break;
            }
        }
        etype = match cursor.first().map(|b| b >> 4)? {
            4 => ETYPE_IPV4,
            6 => ETYPE_IPV6,
            _ => return None,
        };
    }

    match etype {
        ETYPE_IPV4 => parse_ipv4_packet(cursor),
        ETYPE_IPV6 => parse_ipv6_packet(cursor),
        _ => None,
    }
}

fn parse_ipv4_packet(data: &[u8]) -> Option<SampledHeader> {
    if data.len() < 20 {
        return None;
    }
    let ihl = ((data[0] & 0x0f) as usize).saturating_mul(4);
    if ihl < 20 || ihl > data.len() {
        return None;
    }

    let total_length = u16::from_be_bytes([data[2], data[3]]);
    let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    // Only the first fragment carries the transport header.
    let (src_port, dst_port) = if fragment_offset == 0 {
        parse_transport_ports(protocol, &data[ihl..])
    } else {
        (0, 0)
    };

    Some(SampledHeader {
        src_addr: IpAddr::V4(src),
        dst_addr: IpAddr::V4(dst),
        protocol,
        src_port,
        dst_port,
        ip_length: u64::from(total_length),
    })
}

fn parse_ipv6_packet(data: &[u8]) -> Option<SampledHeader> {
    if data.len() < 40 {
        return None;
    }

    let payload_length = u16::from_be_bytes([data[4], data[5]]);
    let next_header = data[6];
    let mut src_bytes = [0_u8; 16];
    let mut dst_bytes = [0_u8; 16];
    src_bytes.copy_from_slice(&data[8..24]);
    dst_bytes.copy_from_slice(&data[24..40]);
    let (src_port, dst_port) = parse_transport_ports(next_header, &data[40..]);

    Some(SampledHeader {
        src_addr: IpAddr::V6(Ipv6Addr::from(src_bytes)),
        dst_addr: IpAddr::V6(Ipv6Addr::from(dst_bytes)),
        protocol: next_header,
        src_port,
        dst_port,
        ip_length: u64::from(payload_length).saturating_add(40),
    })
}

fn parse_transport_ports(protocol: u8, data: &[u8]) -> (u16, u16) {
    match protocol {
        // tcp, udp, sctp
        6 | 17 | 132 if data.len() >= 4 => (
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
        ),
        _ => (0, 0),
    }
}
