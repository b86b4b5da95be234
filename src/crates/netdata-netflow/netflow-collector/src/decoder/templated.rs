//! NetFlow v9 and IPFIX decoding.
//!
//! Data records are decoded by the exporter's `netflow_parser` scope. Before
//! that, the message is walked set by set to keep template bookkeeping and
//! the options sampling table: template ids are learned in packet order, so
//! a data set that precedes its template is reported as a template error
//! even though the parser scope keeps the template for later messages.

use super::fields::{self, Dialect, RecordFields, TimeRef};
use super::template::{Template, TemplateCache, TemplateField, TemplateKind, TemplateSystem};
use super::timestamp_from_millis;
use super::wire::{Reader, need};
use crate::error::DecodeError;
use crate::flow::{FlowRecord, FlowVersion, ip_with_prefix};
use netflow_parser::NetflowPacket;
use netflow_parser::variable_versions::ipfix::{FlowSetBody as IPFixFlowSetBody, IPFix};
use netflow_parser::variable_versions::v9::{FlowSetBody as V9FlowSetBody, V9};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const V9_HEADER_LEN: usize = 20;
const IPFIX_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;

const V9_TEMPLATE_SET: u16 = 0;
const V9_OPTIONS_TEMPLATE_SET: u16 = 1;
const IPFIX_TEMPLATE_SET: u16 = 2;
const IPFIX_OPTIONS_TEMPLATE_SET: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;

const VARIABLE_LENGTH: u16 = u16::MAX;
const ENTERPRISE_BIT: u16 = 0x8000;

// Options fields feeding the sampler table. Same codes in both dialects
// except where noted.
const FIELD_SAMPLING_INTERVAL: u16 = 34;
const FIELD_SAMPLER_ID: u16 = 48;
const FIELD_SAMPLER_RANDOM_INTERVAL: u16 = 50;
const FIELD_V9_SAMPLER_RANDOM_INTERVAL: u16 = 49;
const FIELD_SELECTOR_ID: u16 = 302;
const FIELD_SAMPLING_PACKET_INTERVAL: u16 = 305;
const FIELD_SAMPLING_PACKET_SPACE: u16 = 306;

#[derive(Debug, Clone, Copy)]
struct MessageHeader {
    dialect: Dialect,
    domain: u32,
    /// Exporter boot time, known only for v9 (`unix_secs - sys_uptime`).
    boot_millis: Option<u64>,
    export_millis: u64,
}

impl MessageHeader {
    fn resolve(&self, time: TimeRef, system_init_millis: Option<u64>) -> Option<u64> {
        match time {
            TimeRef::Uptime(millis) => system_init_millis
                .or(self.boot_millis)
                .map(|boot| boot.saturating_add(millis)),
            TimeRef::UnixSeconds(secs) => Some(secs.saturating_mul(1_000)),
            TimeRef::UnixMillis(millis) => Some(millis),
        }
    }

    fn flow_version(&self) -> FlowVersion {
        match self.dialect {
            Dialect::V9 => FlowVersion::V9,
            Dialect::Ipfix => FlowVersion::Ipfix,
        }
    }

    fn what(&self) -> &'static str {
        match self.dialect {
            Dialect::V9 => "netflow v9 packet",
            Dialect::Ipfix => "ipfix message",
        }
    }
}

struct FlowSet<'a> {
    id: u16,
    body: &'a [u8],
}

pub(crate) fn decode(
    payload: &[u8],
    exporter: IpAddr,
    dialect: Dialect,
    cache: &mut TemplateCache,
) -> Result<Vec<FlowRecord>, DecodeError> {
    let (header, body) = parse_header(payload, dialect)?;
    let sets = split_sets(body)?;
    let state = cache.exporter_mut(exporter);
    let missing = track_sets(&mut state.system, &header, &sets, exporter)?;

    // The parser sees every well-formed message so its scope learns the
    // same templates as the tracker.
    let parsed = state
        .parser
        .parse_from_source(SocketAddr::new(exporter, 0), payload)
        .map_err(|err| DecodeError::malformed(header.what(), err.to_string()));
    if let Some(err) = missing {
        return Err(err);
    }
    let packets = parsed?;

    let exporter_ip = exporter.to_string();
    let mut records = Vec::new();
    for packet in packets {
        match packet {
            NetflowPacket::V9(packet) if dialect == Dialect::V9 => {
                append_v9_records(&state.system, &header, &exporter_ip, packet, &mut records)
            }
            NetflowPacket::IPFix(packet) if dialect == Dialect::Ipfix => {
                append_ipfix_records(&state.system, &header, &exporter_ip, packet, &mut records)
            }
            _ => {}
        }
    }
    Ok(records)
}

/// Walks the sets in order: learns templates, feeds options data into the
/// sampler table and returns the first data set whose template is unknown.
fn track_sets(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    sets: &[FlowSet<'_>],
    exporter: IpAddr,
) -> Result<Option<DecodeError>, DecodeError> {
    let mut missing = None;
    for set in sets {
        match (header.dialect, set.id) {
            (Dialect::V9, V9_TEMPLATE_SET) | (Dialect::Ipfix, IPFIX_TEMPLATE_SET) => {
                learn_templates(system, header, set.body)?
            }
            (Dialect::V9, V9_OPTIONS_TEMPLATE_SET) => {
                learn_v9_options_templates(system, header, set.body)?
            }
            (Dialect::Ipfix, IPFIX_OPTIONS_TEMPLATE_SET) => {
                learn_ipfix_options_templates(system, header, set.body)?
            }
            (_, id) if id >= MIN_DATA_SET_ID => {
                let version = header.dialect.version();
                match system.get(version, header.domain, id) {
                    Some(template) if template.kind == TemplateKind::Options => {
                        let template = template.clone();
                        observe_sampling_options(system, header, &template, set.body);
                    }
                    Some(_) => {}
                    None => {
                        missing.get_or_insert(DecodeError::TemplateNotFound {
                            exporter,
                            version,
                            domain: header.domain,
                            template_id: id,
                        });
                    }
                }
            }
            (_, id) => tracing::debug!("skipping reserved set id {} from {}", id, exporter),
        }
    }
    Ok(missing)
}

fn parse_header(payload: &[u8], dialect: Dialect) -> Result<(MessageHeader, &[u8]), DecodeError> {
    match dialect {
        Dialect::V9 => {
            if payload.len() < V9_HEADER_LEN {
                return Err(DecodeError::truncated("netflow v9 header"));
            }
            let sys_uptime = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            let unix_secs = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
            let source_id = u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]);
            let export_millis = u64::from(unix_secs).saturating_mul(1_000);
            Ok((
                MessageHeader {
                    dialect,
                    domain: source_id,
                    boot_millis: Some(export_millis.saturating_sub(u64::from(sys_uptime))),
                    export_millis,
                },
                &payload[V9_HEADER_LEN..],
            ))
        }
        Dialect::Ipfix => {
            if payload.len() < IPFIX_HEADER_LEN {
                return Err(DecodeError::truncated("ipfix header"));
            }
            let length = u16::from_be_bytes([payload[2], payload[3]]) as usize;
            if length < IPFIX_HEADER_LEN {
                return Err(DecodeError::malformed(
                    "ipfix header",
                    format!("message length {length} is shorter than the header"),
                ));
            }
            if length > payload.len() {
                return Err(DecodeError::truncated("ipfix message"));
            }
            let export_time = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            let domain = u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]);
            Ok((
                MessageHeader {
                    dialect,
                    domain,
                    boot_millis: None,
                    export_millis: u64::from(export_time).saturating_mul(1_000),
                },
                &payload[IPFIX_HEADER_LEN..length],
            ))
        }
    }
}

fn split_sets(body: &[u8]) -> Result<Vec<FlowSet<'_>>, DecodeError> {
    let mut sets = Vec::new();
    let mut offset = 0_usize;

    while offset.saturating_add(SET_HEADER_LEN) <= body.len() {
        let id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        if length < SET_HEADER_LEN {
            return Err(DecodeError::malformed(
                "flowset",
                format!("set {id} declares length {length}"),
            ));
        }
        let end = offset.saturating_add(length);
        if end > body.len() {
            return Err(DecodeError::truncated("flowset"));
        }
        sets.push(FlowSet {
            id,
            body: &body[offset + SET_HEADER_LEN..end],
        });
        offset = end;
    }

    Ok(sets)
}

fn read_field_specs(
    reader: &mut Reader<'_>,
    count: usize,
    dialect: Dialect,
) -> Result<Vec<TemplateField>, DecodeError> {
    let mut fields = Vec::with_capacity(count.min(128));
    for _ in 0..count {
        let raw_type = need(reader.u16(), "template field")?;
        let length = need(reader.u16(), "template field")?;

        let (field_type, enterprise) = if dialect == Dialect::Ipfix && raw_type & ENTERPRISE_BIT != 0 {
            (raw_type & !ENTERPRISE_BIT, Some(need(reader.u32(), "enterprise number")?))
        } else {
            (raw_type, None)
        };
        if length == VARIABLE_LENGTH && dialect == Dialect::V9 {
            return Err(DecodeError::malformed(
                "template field",
                format!("variable length field {field_type} in netflow v9"),
            ));
        }

        fields.push(TemplateField {
            field_type,
            length,
            enterprise,
        });
    }
    Ok(fields)
}

fn store_template(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    template_id: u16,
    template: Template,
) -> Result<(), DecodeError> {
    if template.min_record_len() == 0 {
        return Err(DecodeError::malformed(
            "template",
            format!("template {template_id} describes zero-length records"),
        ));
    }
    system.insert(header.dialect.version(), header.domain, template_id, template);
    Ok(())
}

fn learn_templates(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    body: &[u8],
) -> Result<(), DecodeError> {
    let mut reader = Reader::new(body);
    while reader.remaining() >= 4 {
        let template_id = need(reader.u16(), "template record")?;
        let field_count = need(reader.u16(), "template record")? as usize;
        if template_id < MIN_DATA_SET_ID {
            break;
        }
        if field_count == 0 {
            system.withdraw(header.dialect.version(), header.domain, template_id);
            continue;
        }

        let fields = read_field_specs(&mut reader, field_count, header.dialect)?;
        store_template(
            system,
            header,
            template_id,
            Template {
                kind: TemplateKind::Data,
                scope_count: 0,
                fields,
            },
        )?;
    }
    Ok(())
}

/// v9 options templates give scope and option lengths in bytes.
fn learn_v9_options_templates(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    body: &[u8],
) -> Result<(), DecodeError> {
    let mut reader = Reader::new(body);
    while reader.remaining() >= 6 {
        let template_id = need(reader.u16(), "options template")?;
        let scope_len = need(reader.u16(), "options template")? as usize;
        let option_len = need(reader.u16(), "options template")? as usize;
        if template_id < MIN_DATA_SET_ID {
            break;
        }

        let scope_count = scope_len / 4;
        let fields = read_field_specs(&mut reader, scope_count + option_len / 4, Dialect::V9)?;
        store_template(
            system,
            header,
            template_id,
            Template {
                kind: TemplateKind::Options,
                scope_count,
                fields,
            },
        )?;
    }
    Ok(())
}

fn learn_ipfix_options_templates(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    body: &[u8],
) -> Result<(), DecodeError> {
    let mut reader = Reader::new(body);
    while reader.remaining() >= 4 {
        let template_id = need(reader.u16(), "options template")?;
        let field_count = need(reader.u16(), "options template")? as usize;
        if template_id < MIN_DATA_SET_ID {
            break;
        }
        if field_count == 0 {
            system.withdraw(header.dialect.version(), header.domain, template_id);
            continue;
        }

        let scope_count = need(reader.u16(), "options template")? as usize;
        let fields = read_field_specs(&mut reader, field_count, Dialect::Ipfix)?;
        store_template(
            system,
            header,
            template_id,
            Template {
                kind: TemplateKind::Options,
                scope_count,
                fields,
            },
        )?;
    }
    Ok(())
}

fn observe_sampling_options(
    system: &mut TemplateSystem,
    header: &MessageHeader,
    template: &Template,
    body: &[u8],
) {
    let min_len = template.min_record_len().max(1);
    let mut reader = Reader::new(body);

    // Anything shorter than one record is set padding.
    while reader.remaining() >= min_len {
        let Some(options) = read_options_record(&mut reader, template, header.dialect) else {
            break;
        };
        if let Some(rate) = options.reported_sampling_rate()
            && rate > 0
        {
            let sampler_id = options.sampler_id.unwrap_or(0);
            system.set_sampling_rate(header.dialect.version(), header.domain, sampler_id, rate);
        }
    }
}

fn read_options_record(
    reader: &mut Reader<'_>,
    template: &Template,
    dialect: Dialect,
) -> Option<RecordFields> {
    let mut options = RecordFields::default();

    for (index, field) in template.fields.iter().enumerate() {
        let length = if field.length == VARIABLE_LENGTH {
            match reader.u8()? {
                255 => reader.u16()? as usize,
                short => short as usize,
            }
        } else {
            field.length as usize
        };
        let value = reader.take(length)?;

        // v9 scope field types live in their own numbering space.
        let v9_scope = dialect == Dialect::V9 && index < template.scope_count;
        if field.enterprise.is_some() || v9_scope || length > 8 {
            continue;
        }
        let number = value
            .iter()
            .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte));
        match (dialect, field.field_type) {
            (_, FIELD_SAMPLING_INTERVAL)
            | (Dialect::V9, FIELD_V9_SAMPLER_RANDOM_INTERVAL)
            | (Dialect::Ipfix, FIELD_SAMPLER_RANDOM_INTERVAL) => {
                if number > 0 {
                    options.sampling_rate = number;
                }
            }
            (_, FIELD_SAMPLER_ID) | (Dialect::Ipfix, FIELD_SELECTOR_ID) => {
                options.sampler_id = Some(number)
            }
            (Dialect::Ipfix, FIELD_SAMPLING_PACKET_INTERVAL) => {
                options.packet_interval = Some(number)
            }
            (Dialect::Ipfix, FIELD_SAMPLING_PACKET_SPACE) => options.packet_space = Some(number),
            _ => {}
        }
    }

    Some(options)
}

fn append_v9_records(
    system: &TemplateSystem,
    header: &MessageHeader,
    exporter_ip: &str,
    packet: V9,
    out: &mut Vec<FlowRecord>,
) {
    for flowset in packet.flowsets {
        let V9FlowSetBody::Data(data) = flowset.body else {
            continue;
        };
        for record in data.fields {
            let mut parsed = RecordFields::default();
            for (field, value) in record {
                if let Some(decode_field) = fields::lookup_v9(field) {
                    decode_field(&mut parsed, &value);
                }
            }
            out.extend(build_record(system, header, exporter_ip, parsed));
        }
    }
}

fn append_ipfix_records(
    system: &TemplateSystem,
    header: &MessageHeader,
    exporter_ip: &str,
    packet: IPFix,
    out: &mut Vec<FlowRecord>,
) {
    for flowset in packet.flowsets {
        let IPFixFlowSetBody::Data(data) = flowset.body else {
            continue;
        };
        for record in data.fields {
            let mut parsed = RecordFields::default();
            for (field, value) in record {
                if let Some(decode_field) = fields::lookup_ipfix(&field) {
                    decode_field(&mut parsed, &value);
                }
            }
            out.extend(build_record(system, header, exporter_ip, parsed));
        }
    }
}

fn build_record(
    system: &TemplateSystem,
    header: &MessageHeader,
    exporter_ip: &str,
    fields: RecordFields,
) -> Option<FlowRecord> {
    if fields.is_empty_flow() {
        return None;
    }

    let version = header.dialect.version();
    let mut record = FlowRecord::new(exporter_ip.to_string(), header.flow_version());
    record.key.src_prefix = fields
        .src_addr
        .map(|ip| ip_with_prefix(ip, fields.src_mask))
        .unwrap_or_default();
    record.key.dst_prefix = fields
        .dst_addr
        .map(|ip| ip_with_prefix(ip, fields.dst_mask))
        .unwrap_or_default();
    record.key.src_port = fields.src_port;
    record.key.dst_port = fields.dst_port;
    record.key.protocol = fields.protocol;
    record.key.src_as = fields.src_as;
    record.key.dst_as = fields.dst_as;
    record.key.in_if = fields.in_if;
    record.key.out_if = fields.out_if;

    record.bytes = fields.bytes;
    record.packets = fields.packets;
    record.flows = fields.flows.max(1);
    record.raw_bytes = fields.bytes;
    record.raw_packets = fields.packets;
    record.direction = fields.direction;
    record.sampling_rate = fields
        .reported_sampling_rate()
        .or_else(|| {
            fields
                .sampler_id
                .and_then(|id| system.sampling_rate(version, header.domain, id))
        })
        .or_else(|| system.sampling_rate(version, header.domain, 0))
        .unwrap_or(0);

    let start = fields
        .flow_start
        .and_then(|time| header.resolve(time, fields.system_init_millis));
    let end = fields
        .flow_end
        .and_then(|time| header.resolve(time, fields.system_init_millis));
    if let Some(ts) = timestamp_from_millis(end.or(start).unwrap_or(header.export_millis)) {
        record.timestamp = ts;
    }
    if let (Some(start), Some(end)) = (start, end) {
        record.duration = Duration::from_millis(end.saturating_sub(start));
    }

    Some(record)
}
