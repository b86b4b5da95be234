//! NetFlow v5: fixed header and 48-byte records, decoded by `netflow_parser`.

use super::template::TemplateCache;
use super::timestamp_from_millis;
use crate::error::DecodeError;
use crate::flow::{FlowRecord, FlowVersion, ip_with_prefix};
use netflow_parser::NetflowPacket;
use netflow_parser::static_versions::v5::V5;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 48;

/// Lower 14 bits carry the interval, the top two the sampling mode.
pub(crate) fn decode_sampling_interval(raw: u16) -> u64 {
    let interval = raw & 0x3fff;
    if interval == 0 { 1 } else { u64::from(interval) }
}

pub(crate) fn decode(
    payload: &[u8],
    exporter: IpAddr,
    cache: &mut TemplateCache,
) -> Result<Vec<FlowRecord>, DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(DecodeError::truncated("netflow v5 header"));
    }
    let count = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let needed = HEADER_LEN.saturating_add(count.saturating_mul(RECORD_LEN));
    if payload.len() < needed {
        return Err(DecodeError::malformed(
            "netflow v5 packet",
            format!(
                "header declares {count} records but only {} bytes present",
                payload.len()
            ),
        ));
    }

    let packets = cache
        .exporter_mut(exporter)
        .parser
        .parse_from_source(SocketAddr::new(exporter, 0), payload)
        .map_err(|err| DecodeError::malformed("netflow v5 packet", err.to_string()))?;

    let exporter_ip = exporter.to_string();
    let mut records = Vec::with_capacity(count);
    for packet in packets {
        if let NetflowPacket::V5(packet) = packet {
            append_v5_records(&exporter_ip, packet, &mut records);
        }
    }
    Ok(records)
}

fn append_v5_records(exporter_ip: &str, packet: V5, out: &mut Vec<FlowRecord>) {
    let header = &packet.header;
    let sampling_rate = decode_sampling_interval(header.sampling_interval as u16);
    let boot_millis = (header.unix_secs as u64)
        .saturating_mul(1_000)
        .saturating_add(header.unix_nsecs as u64 / 1_000_000)
        .saturating_sub(header.sys_up_time as u64);

    for flow in &packet.flowsets {
        let mut record = FlowRecord::new(exporter_ip.to_string(), FlowVersion::V5);
        record.key.src_prefix = ip_with_prefix(flow.src_addr.into(), flow.src_mask as u8);
        record.key.dst_prefix = ip_with_prefix(flow.dst_addr.into(), flow.dst_mask as u8);
        record.key.src_port = flow.src_port as u16;
        record.key.dst_port = flow.dst_port as u16;
        record.key.protocol = flow.protocol_number as u8;
        record.key.src_as = flow.src_as as u32;
        record.key.dst_as = flow.dst_as as u32;
        record.key.in_if = flow.input as u32;
        record.key.out_if = flow.output as u32;
        record.bytes = flow.d_octets as u64;
        record.packets = flow.d_pkts as u64;
        record.flows = 1;
        record.raw_bytes = record.bytes;
        record.raw_packets = record.packets;
        record.sampling_rate = sampling_rate;

        let first = flow.first as u64;
        let last = flow.last as u64;
        if let Some(ts) = timestamp_from_millis(boot_millis.saturating_add(last)) {
            record.timestamp = ts;
        }
        record.duration = Duration::from_millis(last.saturating_sub(first));

        out.push(record);
    }
}
