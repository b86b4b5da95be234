//! Hand-built datagrams shared by the decoder tests.

pub(crate) const V5_SYS_UPTIME: u32 = 60_000;

/// Information element ids used to build templates.
pub(crate) mod field_types {
    pub(crate) const IN_BYTES: u16 = 1;
    pub(crate) const IN_PKTS: u16 = 2;
    pub(crate) const PROTOCOL: u16 = 4;
    pub(crate) const L4_SRC_PORT: u16 = 7;
    pub(crate) const IPV4_SRC_ADDR: u16 = 8;
    pub(crate) const SRC_MASK: u16 = 9;
    pub(crate) const L4_DST_PORT: u16 = 11;
    pub(crate) const IPV4_DST_ADDR: u16 = 12;
    pub(crate) const DST_MASK: u16 = 13;
    pub(crate) const LAST_SWITCHED: u16 = 21;
    pub(crate) const FIRST_SWITCHED: u16 = 22;
    pub(crate) const SAMPLING_INTERVAL: u16 = 34;
    pub(crate) const FLOW_SAMPLER_ID: u16 = 48;
    pub(crate) const OCTET_TOTAL_COUNT: u16 = 85;
    pub(crate) const PACKET_TOTAL_COUNT: u16 = 86;
    pub(crate) const OBSERVATION_DOMAIN_ID: u16 = 149;
    pub(crate) const FLOW_START_MILLISECONDS: u16 = 152;
    pub(crate) const FLOW_END_MILLISECONDS: u16 = 153;
    pub(crate) const SELECTOR_ID: u16 = 302;
    pub(crate) const SAMPLING_PACKET_INTERVAL: u16 = 305;
    pub(crate) const SAMPLING_PACKET_SPACE: u16 = 306;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct V5Record {
    pub(crate) src_addr: [u8; 4],
    pub(crate) dst_addr: [u8; 4],
    pub(crate) input: u16,
    pub(crate) output: u16,
    pub(crate) packets: u32,
    pub(crate) octets: u32,
    pub(crate) first: u32,
    pub(crate) last: u32,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    pub(crate) protocol: u8,
    pub(crate) src_as: u16,
    pub(crate) dst_as: u16,
    pub(crate) src_mask: u8,
    pub(crate) dst_mask: u8,
}

impl Default for V5Record {
    fn default() -> Self {
        Self {
            src_addr: [10, 0, 0, 1],
            dst_addr: [10, 0, 0, 2],
            input: 3,
            output: 4,
            packets: 100,
            octets: 1000,
            first: 50_000,
            last: 55_000,
            src_port: 12345,
            dst_port: 80,
            protocol: 6,
            src_as: 64512,
            dst_as: 15169,
            src_mask: 24,
            dst_mask: 16,
        }
    }
}

pub(crate) fn v5_packet(unix_secs: u32, sampling_interval: u16, records: &[V5Record]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(24 + records.len() * 48);
    packet.extend_from_slice(&5_u16.to_be_bytes());
    packet.extend_from_slice(&(records.len() as u16).to_be_bytes());
    packet.extend_from_slice(&V5_SYS_UPTIME.to_be_bytes());
    packet.extend_from_slice(&unix_secs.to_be_bytes());
    packet.extend_from_slice(&0_u32.to_be_bytes()); // unix_nsecs
    packet.extend_from_slice(&0_u32.to_be_bytes()); // flow_sequence
    packet.extend_from_slice(&[0, 0]); // engine type, engine id
    packet.extend_from_slice(&sampling_interval.to_be_bytes());

    for record in records {
        packet.extend_from_slice(&record.src_addr);
        packet.extend_from_slice(&record.dst_addr);
        packet.extend_from_slice(&[0; 4]); // next hop
        packet.extend_from_slice(&record.input.to_be_bytes());
        packet.extend_from_slice(&record.output.to_be_bytes());
        packet.extend_from_slice(&record.packets.to_be_bytes());
        packet.extend_from_slice(&record.octets.to_be_bytes());
        packet.extend_from_slice(&record.first.to_be_bytes());
        packet.extend_from_slice(&record.last.to_be_bytes());
        packet.extend_from_slice(&record.src_port.to_be_bytes());
        packet.extend_from_slice(&record.dst_port.to_be_bytes());
        packet.extend_from_slice(&[0, 0, record.protocol, 0]); // pad, tcp flags, proto, tos
        packet.extend_from_slice(&record.src_as.to_be_bytes());
        packet.extend_from_slice(&record.dst_as.to_be_bytes());
        packet.extend_from_slice(&[record.src_mask, record.dst_mask, 0, 0]);
    }
    packet
}

fn pad4(mut body: Vec<u8>) -> Vec<u8> {
    while body.len() % 4 != 0 {
        body.push(0);
    }
    body
}

/// A v9 FlowSet or IPFIX Set, zero-padded to a 4-byte boundary.
pub(crate) fn flowset(id: u16, body: &[u8]) -> Vec<u8> {
    let body = pad4(body.to_vec());
    let mut set = Vec::with_capacity(body.len() + 4);
    set.extend_from_slice(&id.to_be_bytes());
    set.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    set.extend_from_slice(&body);
    set
}

fn field_specs(fields: &[(u16, u16)]) -> Vec<u8> {
    fields
        .iter()
        .flat_map(|(field_type, length)| [field_type.to_be_bytes(), length.to_be_bytes()])
        .flatten()
        .collect()
}

pub(crate) fn template_body(template_id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&template_id.to_be_bytes());
    body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    body.extend_from_slice(&field_specs(fields));
    body
}

pub(crate) fn v9_options_template_body(
    template_id: u16,
    scope: &[(u16, u16)],
    options: &[(u16, u16)],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&template_id.to_be_bytes());
    body.extend_from_slice(&((scope.len() * 4) as u16).to_be_bytes());
    body.extend_from_slice(&((options.len() * 4) as u16).to_be_bytes());
    body.extend_from_slice(&field_specs(scope));
    body.extend_from_slice(&field_specs(options));
    body
}

pub(crate) fn ipfix_options_template_body(
    template_id: u16,
    scope_count: u16,
    fields: &[(u16, u16)],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&template_id.to_be_bytes());
    body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    body.extend_from_slice(&scope_count.to_be_bytes());
    body.extend_from_slice(&field_specs(fields));
    body
}

pub(crate) fn v9_packet(unix_secs: u32, sys_uptime: u32, source_id: u32, sets: &[Vec<u8>]) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&9_u16.to_be_bytes());
    packet.extend_from_slice(&(sets.len() as u16).to_be_bytes());
    packet.extend_from_slice(&sys_uptime.to_be_bytes());
    packet.extend_from_slice(&unix_secs.to_be_bytes());
    packet.extend_from_slice(&0_u32.to_be_bytes());
    packet.extend_from_slice(&source_id.to_be_bytes());
    for set in sets {
        packet.extend_from_slice(set);
    }
    packet
}

pub(crate) fn ipfix_packet(export_time: u32, domain: u32, sets: &[Vec<u8>]) -> Vec<u8> {
    let length = 16 + sets.iter().map(Vec::len).sum::<usize>();
    let mut packet = Vec::with_capacity(length);
    packet.extend_from_slice(&10_u16.to_be_bytes());
    packet.extend_from_slice(&(length as u16).to_be_bytes());
    packet.extend_from_slice(&export_time.to_be_bytes());
    packet.extend_from_slice(&0_u32.to_be_bytes());
    packet.extend_from_slice(&domain.to_be_bytes());
    for set in sets {
        packet.extend_from_slice(set);
    }
    packet
}

/// Ethernet frame with optional `(tpid, vlan id)` tags in front of `ip`.
pub(crate) fn ethernet_frame(tags: &[(u16, u16)], ip: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
    for (tpid, vlan) in tags {
        frame.extend_from_slice(&tpid.to_be_bytes());
        frame.extend_from_slice(&vlan.to_be_bytes());
    }
    let etype: u16 = if ip.first().map(|b| b >> 4) == Some(6) {
        0x86dd
    } else {
        0x0800
    };
    frame.extend_from_slice(&etype.to_be_bytes());
    frame.extend_from_slice(ip);
    frame
}

/// IPv4 + TCP headers only; `total_length` is what the IP header claims.
pub(crate) fn ipv4_tcp_packet(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    total_length: u16,
) -> Vec<u8> {
    let mut packet = vec![0x45, 0];
    packet.extend_from_slice(&total_length.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 64, 6, 0, 0]);
    packet.extend_from_slice(&src);
    packet.extend_from_slice(&dst);
    packet.extend_from_slice(&src_port.to_be_bytes());
    packet.extend_from_slice(&dst_port.to_be_bytes());
    packet.extend_from_slice(&[0; 16]);
    packet
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

pub(crate) fn sflow_datagram(agent: [u8; 4], samples: &[Vec<u8>]) -> Vec<u8> {
    let mut datagram = u32s(&[5, 1]);
    datagram.extend_from_slice(&agent);
    datagram.extend_from_slice(&u32s(&[0, 1, 1_000, samples.len() as u32]));
    for sample in samples {
        datagram.extend_from_slice(sample);
    }
    datagram
}

pub(crate) fn sflow_sample(format: u32, body: &[u8]) -> Vec<u8> {
    let mut sample = u32s(&[format, body.len() as u32]);
    sample.extend_from_slice(body);
    sample
}

fn sflow_record(format: u32, body: &[u8]) -> Vec<u8> {
    sflow_sample(format, body)
}

pub(crate) fn sflow_flow_sample(rate: u32, input: u32, output: u32, records: &[Vec<u8>]) -> Vec<u8> {
    let mut body = u32s(&[1, 0, rate, 0, 0, input, output, records.len() as u32]);
    for record in records {
        body.extend_from_slice(record);
    }
    sflow_sample(1, &body)
}

pub(crate) fn sflow_expanded_flow_sample(
    rate: u32,
    input: u32,
    output: u32,
    records: &[Vec<u8>],
) -> Vec<u8> {
    let mut body = u32s(&[1, 0, 0, rate, 0, 0, 0, input, 0, output, records.len() as u32]);
    for record in records {
        body.extend_from_slice(record);
    }
    sflow_sample(3, &body)
}

pub(crate) fn sflow_sampled_ipv4(
    length: u32,
    protocol: u32,
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u32,
    dst_port: u32,
) -> Vec<u8> {
    let mut body = u32s(&[length, protocol]);
    body.extend_from_slice(&src);
    body.extend_from_slice(&dst);
    body.extend_from_slice(&u32s(&[src_port, dst_port, 0, 0]));
    sflow_record(3, &body)
}

pub(crate) fn sflow_raw_header(frame_length: u32, header: &[u8]) -> Vec<u8> {
    let mut body = u32s(&[1, frame_length, 4, header.len() as u32]);
    body.extend_from_slice(header);
    sflow_record(1, &pad4(body))
}

pub(crate) fn sflow_extended_router(src_mask: u32, dst_mask: u32) -> Vec<u8> {
    sflow_record(1002, &u32s(&[1, 0xc000_0201, src_mask, dst_mask]))
}

pub(crate) fn sflow_extended_gateway(router_as: u32, src_as: u32, segments: &[&[u32]]) -> Vec<u8> {
    let mut body = u32s(&[1, 0xc000_0201, router_as, src_as, 0, segments.len() as u32]);
    for segment in segments {
        body.extend_from_slice(&u32s(&[2, segment.len() as u32]));
        body.extend_from_slice(&u32s(segment));
    }
    body.extend_from_slice(&u32s(&[0, 0])); // communities, local pref
    sflow_record(1003, &body)
}
