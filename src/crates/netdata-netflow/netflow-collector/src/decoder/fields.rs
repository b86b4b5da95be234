//! Field dispatch for templated (v9 / IPFIX) data records.
//!
//! `netflow_parser` hands back each record as `(field, value)` pairs. Every
//! field we care about maps to a small function that folds its value into a
//! [`RecordFields`] accumulator. The tables are built once on first use;
//! fields that are not in them are ignored.

use crate::flow::Direction;
use netflow_parser::variable_versions::data_number::{DataNumber, FieldValue};
use netflow_parser::variable_versions::ipfix_lookup::{IANAIPFixField, IPFixField};
use netflow_parser::variable_versions::v9_lookup::V9Field;
use std::net::IpAddr;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Dialect {
    V9,
    Ipfix,
}

impl Dialect {
    pub(crate) fn version(self) -> u16 {
        match self {
            Self::V9 => 9,
            Self::Ipfix => 10,
        }
    }
}

/// A flow start/end time in whichever encoding the exporter chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeRef {
    /// Milliseconds since the exporter booted.
    Uptime(u64),
    UnixSeconds(u64),
    UnixMillis(u64),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct RecordFields {
    pub(crate) bytes: u64,
    pub(crate) packets: u64,
    pub(crate) flows: u64,
    pub(crate) protocol: u8,
    pub(crate) src_addr: Option<IpAddr>,
    pub(crate) dst_addr: Option<IpAddr>,
    pub(crate) src_mask: u8,
    pub(crate) dst_mask: u8,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    pub(crate) src_as: u32,
    pub(crate) dst_as: u32,
    pub(crate) in_if: u32,
    pub(crate) out_if: u32,
    pub(crate) direction: Direction,
    pub(crate) sampling_rate: u64,
    pub(crate) sampler_id: Option<u64>,
    pub(crate) packet_interval: Option<u64>,
    pub(crate) packet_space: Option<u64>,
    pub(crate) flow_start: Option<TimeRef>,
    pub(crate) flow_end: Option<TimeRef>,
    pub(crate) system_init_millis: Option<u64>,
}

impl RecordFields {
    /// Explicit interval first, then the IPFIX interval/space ratio.
    pub(crate) fn reported_sampling_rate(&self) -> Option<u64> {
        if self.sampling_rate > 0 {
            return Some(self.sampling_rate);
        }
        match (self.packet_interval, self.packet_space) {
            (Some(interval), Some(space)) if interval > 0 => {
                Some(interval.saturating_add(space) / interval)
            }
            _ => None,
        }
    }

    pub(crate) fn is_empty_flow(&self) -> bool {
        self.bytes == 0 && self.packets == 0 && self.flows == 0
    }
}

pub(crate) type FieldDecoder = fn(&mut RecordFields, &FieldValue);

static V9_FIELDS: LazyLock<Vec<(V9Field, FieldDecoder)>> = LazyLock::new(build_v9_table);
static IPFIX_FIELDS: LazyLock<Vec<(IANAIPFixField, FieldDecoder)>> =
    LazyLock::new(build_ipfix_table);

pub(crate) fn lookup_v9(field: V9Field) -> Option<FieldDecoder> {
    V9_FIELDS
        .iter()
        .find(|(known, _)| *known == field)
        .map(|(_, decoder)| *decoder)
}

/// Enterprise and reverse elements have no entry.
pub(crate) fn lookup_ipfix(field: &IPFixField) -> Option<FieldDecoder> {
    let IPFixField::IANA(field) = field else {
        return None;
    };
    IPFIX_FIELDS
        .iter()
        .find(|(known, _)| known == field)
        .map(|(_, decoder)| *decoder)
}

fn build_v9_table() -> Vec<(V9Field, FieldDecoder)> {
    let table: [(V9Field, FieldDecoder); 27] = [
        (V9Field::InBytes, |r, v| r.bytes = counter(v)),
        (V9Field::InPkts, |r, v| r.packets = counter(v)),
        (V9Field::Flows, |r, v| r.flows = counter(v)),
        (V9Field::OutBytes, fill_bytes),
        (V9Field::OutPkts, fill_packets),
        (V9Field::Protocol, |r, v| r.protocol = counter(v) as u8),
        (V9Field::L4SrcPort, |r, v| r.src_port = counter(v) as u16),
        (V9Field::L4DstPort, |r, v| r.dst_port = counter(v) as u16),
        (V9Field::Ipv4SrcAddr, set_src_addr),
        (V9Field::Ipv4DstAddr, set_dst_addr),
        (V9Field::Ipv6SrcAddr, set_src_addr),
        (V9Field::Ipv6DstAddr, set_dst_addr),
        (V9Field::SrcMask, |r, v| r.src_mask = counter(v) as u8),
        (V9Field::DstMask, |r, v| r.dst_mask = counter(v) as u8),
        (V9Field::Ipv6SrcMask, |r, v| r.src_mask = counter(v) as u8),
        (V9Field::Ipv6DstMask, |r, v| r.dst_mask = counter(v) as u8),
        (V9Field::InputSnmp, |r, v| r.in_if = counter(v) as u32),
        (V9Field::OutputSnmp, |r, v| r.out_if = counter(v) as u32),
        (V9Field::SrcAs, |r, v| r.src_as = counter(v) as u32),
        (V9Field::DstAs, |r, v| r.dst_as = counter(v) as u32),
        (V9Field::Direction, set_direction),
        (V9Field::SamplingInterval, |r, v| r.sampling_rate = counter(v)),
        (V9Field::FlowSamplerRandomInterval, |r, v| {
            r.sampling_rate = counter(v)
        }),
        (V9Field::FlowSamplerId, |r, v| r.sampler_id = value_u64(v)),
        (V9Field::FirstSwitched, |r, v| {
            r.flow_start = millis(v).map(TimeRef::Uptime)
        }),
        (V9Field::LastSwitched, |r, v| {
            r.flow_end = millis(v).map(TimeRef::Uptime)
        }),
        (V9Field::FlowStartMilliseconds, |r, v| {
            r.flow_start = millis(v).map(TimeRef::UnixMillis)
        }),
    ];
    table.into_iter().collect()
}

fn build_ipfix_table() -> Vec<(IANAIPFixField, FieldDecoder)> {
    let table: [(IANAIPFixField, FieldDecoder); 37] = [
        (IANAIPFixField::OctetDeltaCount, |r, v| r.bytes = counter(v)),
        (IANAIPFixField::PacketDeltaCount, |r, v| r.packets = counter(v)),
        (IANAIPFixField::PostOctetDeltaCount, fill_bytes),
        (IANAIPFixField::PostPacketDeltaCount, fill_packets),
        (IANAIPFixField::OctetTotalCount, fill_bytes),
        (IANAIPFixField::PacketTotalCount, fill_packets),
        (IANAIPFixField::ProtocolIdentifier, |r, v| {
            r.protocol = counter(v) as u8
        }),
        (IANAIPFixField::SourceTransportPort, |r, v| {
            r.src_port = counter(v) as u16
        }),
        (IANAIPFixField::DestinationTransportPort, |r, v| {
            r.dst_port = counter(v) as u16
        }),
        (IANAIPFixField::SourceIpv4address, set_src_addr),
        (IANAIPFixField::DestinationIpv4address, set_dst_addr),
        (IANAIPFixField::SourceIpv6address, set_src_addr),
        (IANAIPFixField::DestinationIpv6address, set_dst_addr),
        (IANAIPFixField::SourceIpv4prefixLength, |r, v| {
            r.src_mask = counter(v) as u8
        }),
        (IANAIPFixField::DestinationIpv4prefixLength, |r, v| {
            r.dst_mask = counter(v) as u8
        }),
        (IANAIPFixField::SourceIpv6prefixLength, |r, v| {
            r.src_mask = counter(v) as u8
        }),
        (IANAIPFixField::DestinationIpv6prefixLength, |r, v| {
            r.dst_mask = counter(v) as u8
        }),
        (IANAIPFixField::IngressInterface, |r, v| r.in_if = counter(v) as u32),
        (IANAIPFixField::EgressInterface, |r, v| r.out_if = counter(v) as u32),
        (IANAIPFixField::BgpSourceAsNumber, |r, v| {
            r.src_as = counter(v) as u32
        }),
        (IANAIPFixField::BgpDestinationAsNumber, |r, v| {
            r.dst_as = counter(v) as u32
        }),
        (IANAIPFixField::FlowDirection, set_direction),
        (IANAIPFixField::SamplingInterval, |r, v| {
            r.sampling_rate = counter(v)
        }),
        (IANAIPFixField::SamplerRandomInterval, |r, v| {
            r.sampling_rate = counter(v)
        }),
        (IANAIPFixField::SamplerId, |r, v| r.sampler_id = value_u64(v)),
        (IANAIPFixField::SelectorId, |r, v| r.sampler_id = value_u64(v)),
        (IANAIPFixField::SamplingPacketInterval, |r, v| {
            r.packet_interval = value_u64(v)
        }),
        (IANAIPFixField::SamplingPacketSpace, |r, v| {
            r.packet_space = value_u64(v)
        }),
        (IANAIPFixField::FlowStartSysUpTime, |r, v| {
            r.flow_start = millis(v).map(TimeRef::Uptime)
        }),
        (IANAIPFixField::FlowEndSysUpTime, |r, v| {
            r.flow_end = millis(v).map(TimeRef::Uptime)
        }),
        (IANAIPFixField::FlowStartSeconds, |r, v| {
            r.flow_start = unix_seconds(v)
        }),
        (IANAIPFixField::FlowEndSeconds, |r, v| r.flow_end = unix_seconds(v)),
        (IANAIPFixField::FlowStartMilliseconds, |r, v| {
            r.flow_start = millis(v).map(TimeRef::UnixMillis)
        }),
        (IANAIPFixField::FlowEndMilliseconds, |r, v| {
            r.flow_end = millis(v).map(TimeRef::UnixMillis)
        }),
        (IANAIPFixField::MinFlowStartMilliseconds, |r, v| {
            if r.flow_start.is_none() {
                r.flow_start = millis(v).map(TimeRef::UnixMillis);
            }
        }),
        (IANAIPFixField::MaxFlowEndMilliseconds, |r, v| {
            if r.flow_end.is_none() {
                r.flow_end = millis(v).map(TimeRef::UnixMillis);
            }
        }),
        (IANAIPFixField::SystemInitTimeMilliseconds, |r, v| {
            r.system_init_millis = millis(v)
        }),
    ];
    table.into_iter().collect()
}

pub(crate) fn value_u64(value: &FieldValue) -> Option<u64> {
    match value {
        FieldValue::DataNumber(number) => data_number_u64(number),
        FieldValue::Duration(duration) => u64::try_from(duration.as_millis()).ok(),
        FieldValue::ProtocolType(protocol) => Some(u64::from(u8::from(*protocol))),
        FieldValue::Vec(raw) | FieldValue::Unknown(raw) if (1..=8).contains(&raw.len()) => Some(
            raw.iter()
                .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        ),
        _ => None,
    }
}

fn data_number_u64(number: &DataNumber) -> Option<u64> {
    match number {
        DataNumber::U8(v) => u64::try_from(*v).ok(),
        DataNumber::I8(v) => u64::try_from(*v).ok(),
        DataNumber::U16(v) => u64::try_from(*v).ok(),
        DataNumber::I16(v) => u64::try_from(*v).ok(),
        DataNumber::U24(v) => u64::try_from(*v).ok(),
        DataNumber::I24(v) => u64::try_from(*v).ok(),
        DataNumber::U32(v) => u64::try_from(*v).ok(),
        DataNumber::I32(v) => u64::try_from(*v).ok(),
        DataNumber::U64(v) => u64::try_from(*v).ok(),
        DataNumber::I64(v) => u64::try_from(*v).ok(),
        DataNumber::U128(v) => u64::try_from(*v).ok(),
        DataNumber::I128(v) => u64::try_from(*v).ok(),
    }
}

fn value_ip(value: &FieldValue) -> Option<IpAddr> {
    match value {
        FieldValue::Ip4Addr(ip) => Some(IpAddr::from(*ip)),
        FieldValue::Ip6Addr(ip) => Some(IpAddr::from(*ip)),
        FieldValue::Vec(raw) | FieldValue::Unknown(raw) => match raw.len() {
            4 => <[u8; 4]>::try_from(raw.as_slice()).ok().map(IpAddr::from),
            16 => <[u8; 16]>::try_from(raw.as_slice()).ok().map(IpAddr::from),
            _ => None,
        },
        _ => None,
    }
}

fn counter(value: &FieldValue) -> u64 {
    value_u64(value).unwrap_or(0)
}

/// Time fields arrive either as a `Duration` or as a plain number of
/// milliseconds, depending on the element's declared type.
fn millis(value: &FieldValue) -> Option<u64> {
    value_u64(value)
}

fn unix_seconds(value: &FieldValue) -> Option<TimeRef> {
    match value {
        FieldValue::Duration(duration) => u64::try_from(duration.as_millis())
            .ok()
            .map(TimeRef::UnixMillis),
        other => value_u64(other).map(TimeRef::UnixSeconds),
    }
}

fn fill_bytes(record: &mut RecordFields, value: &FieldValue) {
    if record.bytes == 0 {
        record.bytes = counter(value);
    }
}

fn fill_packets(record: &mut RecordFields, value: &FieldValue) {
    if record.packets == 0 {
        record.packets = counter(value);
    }
}

fn set_src_addr(record: &mut RecordFields, value: &FieldValue) {
    if let Some(ip) = value_ip(value) {
        record.src_addr = Some(ip);
    }
}

fn set_dst_addr(record: &mut RecordFields, value: &FieldValue) {
    if let Some(ip) = value_ip(value) {
        record.dst_addr = Some(ip);
    }
}

fn set_direction(record: &mut RecordFields, value: &FieldValue) {
    record.direction = Direction::from_wire(counter(value));
}
