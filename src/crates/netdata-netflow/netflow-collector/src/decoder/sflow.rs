//! sFlow v5 datagrams, decoded by `sflow_parser`.
//!
//! Every flow sample becomes at most one record; counter samples and flow
//! records we have no use for are ignored. A datagram the parser rejects
//! fails as a whole.

use super::packet::{SampledHeader, parse_sampled_header};
use crate::error::DecodeError;
use crate::flow::{FlowRecord, FlowVersion, ip_with_prefix};
use chrono::{DateTime, Utc};
use sflow_parser::models::{Address, FlowData, SampleData};
use sflow_parser::parse_datagram;
use std::net::IpAddr;

pub(crate) const SFLOW_VERSION: u32 = 5;

/// ifIndex reserved for traffic to or from the agent itself.
const LOCAL_INTERFACE: u32 = 0x3fff_ffff;
const INTERFACE_FORMAT_INDEX: u32 = 0;

#[derive(Debug, Default)]
struct SampleFields {
    sampling_rate: u32,
    input: u32,
    output: u32,
    frame_length: Option<u64>,
    header: Option<SampledHeader>,
    sampled_ip: Option<SampledHeader>,
    src_mask: u8,
    dst_mask: u8,
    src_as: u32,
    dst_as: u32,
}

pub(crate) fn decode(
    payload: &[u8],
    exporter: IpAddr,
    now: DateTime<Utc>,
) -> Result<Vec<FlowRecord>, DecodeError> {
    let datagram = parse_datagram(payload)
        .map_err(|err| DecodeError::malformed("sflow datagram", format!("{err:?}")))?;

    let exporter_ip = agent_ip(&datagram.agent_address)
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(exporter)
        .to_string();

    let mut records = Vec::new();
    for sample in datagram.samples {
        let fields = match sample.sample_data {
            SampleData::FlowSample(sample) => {
                let input = if sample.input.is_single() {
                    sample.input.value()
                } else {
                    0
                };
                let output = if sample.output.is_single() {
                    sample.output.value()
                } else {
                    0
                };
                let flow_data: Vec<FlowData> = sample
                    .flow_records
                    .into_iter()
                    .map(|record| record.flow_data)
                    .collect();
                sample_fields(sample.sampling_rate, input, output, &flow_data)
            }
            SampleData::FlowSampleExpanded(sample) => {
                let input = expanded_interface(sample.input.format, sample.input.value);
                let output = expanded_interface(sample.output.format, sample.output.value);
                let flow_data: Vec<FlowData> = sample
                    .flow_records
                    .into_iter()
                    .map(|record| record.flow_data)
                    .collect();
                sample_fields(sample.sampling_rate, input, output, &flow_data)
            }
            _ => continue,
        };
        match build_record(&exporter_ip, fields, now) {
            Some(record) => records.push(record),
            None => tracing::debug!("skipping sflow sample without length from {}", exporter_ip),
        }
    }

    Ok(records)
}

fn agent_ip(address: &Address) -> Option<IpAddr> {
    match address {
        Address::IPv4(ip) => Some(IpAddr::from(*ip)),
        Address::IPv6(ip) => Some(IpAddr::from(*ip)),
        Address::Unknown => None,
    }
}

fn expanded_interface(format: u32, value: u32) -> u32 {
    if format == INTERFACE_FORMAT_INDEX {
        value
    } else {
        0
    }
}

fn sample_fields(sampling_rate: u32, input: u32, output: u32, flow_data: &[FlowData]) -> SampleFields {
    let local = |index: u32| if index == LOCAL_INTERFACE { 0 } else { index };
    let mut fields = SampleFields {
        sampling_rate,
        input: local(input),
        output: local(output),
        ..Default::default()
    };

    for data in flow_data {
        match data {
            FlowData::SampledHeader(sampled) => {
                fields.frame_length = Some(sampled.frame_length as u64);
                fields.header = parse_sampled_header(&sampled.protocol, &sampled.header);
            }
            FlowData::SampledIpv4(sampled) => {
                fields.sampled_ip = Some(SampledHeader {
                    src_addr: IpAddr::from(sampled.src_ip),
                    dst_addr: IpAddr::from(sampled.dst_ip),
                    protocol: sampled.protocol as u8,
                    src_port: sampled.src_port as u16,
                    dst_port: sampled.dst_port as u16,
                    ip_length: sampled.length as u64,
                });
            }
            FlowData::SampledIpv6(sampled) => {
                fields.sampled_ip = Some(SampledHeader {
                    src_addr: IpAddr::from(sampled.src_ip),
                    dst_addr: IpAddr::from(sampled.dst_ip),
                    protocol: sampled.protocol as u8,
                    src_port: sampled.src_port as u16,
                    dst_port: sampled.dst_port as u16,
                    ip_length: sampled.length as u64,
                });
            }
            FlowData::ExtendedRouter(router) => {
                fields.src_mask = router.src_mask_len as u8;
                fields.dst_mask = router.dst_mask_len as u8;
            }
            FlowData::ExtendedGateway(gateway) => {
                fields.src_as = gateway.src_as;
                fields.dst_as = gateway
                    .dst_as_path
                    .iter()
                    .flat_map(|segment| segment.path.iter().copied())
                    .last()
                    .unwrap_or(gateway.as_number);
            }
            _ => {}
        }
    }
    fields
}

fn build_record(exporter_ip: &str, fields: SampleFields, now: DateTime<Utc>) -> Option<FlowRecord> {
    let tuple = fields.sampled_ip.or(fields.header);
    let bytes = fields
        .sampled_ip
        .map(|ip| ip.ip_length)
        .filter(|len| *len > 0)
        .or_else(|| fields.header.map(|h| h.ip_length).filter(|len| *len > 0))
        .or(fields.frame_length)?;

    let mut record = FlowRecord::new(exporter_ip.to_string(), FlowVersion::Sflow);
    record.timestamp = now;
    if let Some(tuple) = tuple {
        record.key.src_prefix = ip_with_prefix(tuple.src_addr, fields.src_mask);
        record.key.dst_prefix = ip_with_prefix(tuple.dst_addr, fields.dst_mask);
        record.key.src_port = tuple.src_port;
        record.key.dst_port = tuple.dst_port;
        record.key.protocol = tuple.protocol;
    }
    record.key.src_as = fields.src_as;
    record.key.dst_as = fields.dst_as;
    record.key.in_if = fields.input;
    record.key.out_if = fields.output;

    record.bytes = bytes;
    record.packets = 1;
    record.flows = 1;
    record.raw_bytes = bytes;
    record.raw_packets = 1;
    record.sampling_rate = u64::from(fields.sampling_rate);
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test_packets::{
        ethernet_frame, ipv4_tcp_packet, sflow_datagram, sflow_expanded_flow_sample,
        sflow_extended_gateway, sflow_extended_router, sflow_flow_sample, sflow_raw_header,
        sflow_sample, sflow_sampled_ipv4,
    };
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp")
    }

    fn sender() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))
    }

    #[test]
    fn sampled_ipv4_record_yields_one_flow() {
        let sample = sflow_flow_sample(
            512,
            7,
            9,
            &[sflow_sampled_ipv4(1500, 6, [10, 0, 0, 1], [10, 0, 0, 2], 5555, 22)],
        );
        let datagram = sflow_datagram([192, 0, 2, 50], &[sample]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.exporter_ip, "192.0.2.50", "agent address wins");
        assert_eq!(record.key.src_prefix, "10.0.0.1");
        assert_eq!(record.key.dst_prefix, "10.0.0.2");
        assert_eq!(record.key.src_port, 5555);
        assert_eq!(record.key.dst_port, 22);
        assert_eq!(record.key.protocol, 6);
        assert_eq!(record.key.in_if, 7);
        assert_eq!(record.key.out_if, 9);
        assert_eq!(record.bytes, 1500);
        assert_eq!(record.packets, 1);
        assert_eq!(record.sampling_rate, 512);
        assert_eq!(record.timestamp, now());
        assert_eq!(record.version, Some(FlowVersion::Sflow));
    }

    #[test]
    fn raw_header_supplies_tuple_and_length() {
        let ip = ipv4_tcp_packet([172, 16, 1, 1], [172, 16, 2, 2], 33000, 8080, 900);
        let frame = ethernet_frame(&[(0x8100, 42)], &ip);
        let sample = sflow_flow_sample(100, 1, 2, &[sflow_raw_header(918, &frame)]);
        let datagram = sflow_datagram([192, 0, 2, 50], &[sample]);

        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.src_prefix, "172.16.1.1");
        assert_eq!(records[0].key.dst_port, 8080);
        assert_eq!(records[0].bytes, 900, "ip length preferred over frame length");
    }

    #[test]
    fn unparseable_header_falls_back_to_frame_length() {
        let sample = sflow_flow_sample(100, 1, 2, &[sflow_raw_header(1514, &[0xff; 10])]);
        let datagram = sflow_datagram([192, 0, 2, 50], &[sample]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, 1514);
        assert_eq!(records[0].key.src_prefix, "");
    }

    #[test]
    fn expanded_sample_with_router_and_gateway_records() {
        let sample = sflow_expanded_flow_sample(
            2048,
            LOCAL_INTERFACE,
            12,
            &[
                sflow_sampled_ipv4(600, 17, [10, 9, 8, 7], [10, 1, 2, 3], 53, 5353),
                sflow_extended_router(24, 16),
                sflow_extended_gateway(65000, 64999, &[&[174, 3356, 15169]]),
            ],
        );
        let datagram = sflow_datagram([192, 0, 2, 50], &[sample]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.key.in_if, 0, "local interface maps to 0");
        assert_eq!(record.key.out_if, 12);
        assert_eq!(record.key.src_prefix, "10.9.8.7/24");
        assert_eq!(record.key.dst_prefix, "10.1.2.3/16");
        assert_eq!(record.key.src_as, 64999);
        assert_eq!(record.key.dst_as, 15169);
        assert_eq!(record.sampling_rate, 2048);
    }

    #[test]
    fn counter_samples_are_skipped() {
        // sequence number, source id, no counter records
        let counters = sflow_sample(2, &[0; 12]);
        let datagram = sflow_datagram([192, 0, 2, 50], &[counters]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert!(records.is_empty());
    }

    #[test]
    fn unspecified_agent_uses_sender_address() {
        let sample = sflow_flow_sample(
            1,
            1,
            1,
            &[sflow_sampled_ipv4(100, 6, [10, 0, 0, 1], [10, 0, 0, 2], 1, 2)],
        );
        let datagram = sflow_datagram([0, 0, 0, 0], &[sample]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records[0].exporter_ip, "198.51.100.1");
    }

    #[test]
    fn sample_longer_than_datagram_is_malformed() {
        let sample = sflow_flow_sample(1, 1, 1, &[]);
        let mut datagram = sflow_datagram([192, 0, 2, 50], &[sample]);
        datagram.truncate(datagram.len() - 4);
        let err = decode(&datagram, sender(), now()).expect_err("truncated sample");
        assert!(matches!(
            err,
            DecodeError::Malformed {
                what: "sflow datagram",
                ..
            }
        ));
    }

    #[test]
    fn discarded_output_and_compact_local_interface_map_to_zero() {
        // Compact format 1 in the top two bits marks a discarded packet.
        let sample = sflow_flow_sample(
            10,
            LOCAL_INTERFACE,
            0x4000_0000,
            &[sflow_sampled_ipv4(80, 1, [10, 0, 0, 1], [10, 0, 0, 2], 0, 0)],
        );
        let datagram = sflow_datagram([192, 0, 2, 50], &[sample]);
        let records = decode(&datagram, sender(), now()).expect("valid datagram");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.in_if, 0);
        assert_eq!(records[0].key.out_if, 0);
        assert_eq!(records[0].bytes, 80);
    }
}
