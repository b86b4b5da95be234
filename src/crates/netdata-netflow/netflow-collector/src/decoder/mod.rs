//! Flow-export datagram decoding.
//!
//! [`FlowDecoder`] sniffs the protocol of each UDP payload and dispatches it:
//! NetFlow v5, v9 and IPFIX go through a per-exporter `netflow_parser` scope,
//! sFlow through `sflow_parser`. The scopes and the template bookkeeping
//! around them are bounded by an exporter LRU. The decoder is owned by the
//! single ingestion task and is therefore not synchronized.

mod fields;
mod netflow_v5;
mod packet;
mod sflow;
mod template;
mod templated;
mod wire;

#[cfg(test)]
pub(crate) mod test_packets;

use crate::error::DecodeError;
use crate::flow::FlowRecord;
use chrono::{DateTime, Utc};
use fields::Dialect;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use template::TemplateCache;

/// Which wire formats are decoded. NetFlow and IPFIX datagrams of a disabled
/// version are counted and dropped without an error; sFlow datagrams are only
/// recognized while sFlow is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSet {
    pub v5: bool,
    pub v9: bool,
    pub ipfix: bool,
    pub sflow: bool,
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self {
            v5: true,
            v9: true,
            ipfix: true,
            sflow: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub parse_attempts: u64,
    pub parsed_packets: u64,
    pub parse_errors: u64,
    pub template_errors: u64,
    pub disabled_protocol_packets: u64,
    pub netflow_v5_packets: u64,
    pub netflow_v9_packets: u64,
    pub ipfix_packets: u64,
    pub sflow_datagrams: u64,
    pub decoded_records: u64,
}

impl DecodeStats {
    pub fn merge(&mut self, other: &DecodeStats) {
        self.parse_attempts += other.parse_attempts;
        self.parsed_packets += other.parsed_packets;
        self.parse_errors += other.parse_errors;
        self.template_errors += other.template_errors;
        self.disabled_protocol_packets += other.disabled_protocol_packets;
        self.netflow_v5_packets += other.netflow_v5_packets;
        self.netflow_v9_packets += other.netflow_v9_packets;
        self.ipfix_packets += other.ipfix_packets;
        self.sflow_datagrams += other.sflow_datagrams;
        self.decoded_records += other.decoded_records;
    }
}

#[derive(Debug)]
pub struct FlowDecoder {
    protocols: ProtocolSet,
    templates: TemplateCache,
    stats: DecodeStats,
    last: DecodeStats,
}

impl Default for FlowDecoder {
    fn default() -> Self {
        Self::new(ProtocolSet::default(), 0)
    }
}

impl FlowDecoder {
    /// `max_template_exporters` bounds the template cache; 0 leaves it unbounded.
    pub fn new(protocols: ProtocolSet, max_template_exporters: usize) -> Self {
        Self {
            protocols,
            templates: TemplateCache::new(max_template_exporters),
            stats: DecodeStats::default(),
            last: DecodeStats::default(),
        }
    }

    pub fn decode(&mut self, payload: &[u8], exporter: IpAddr) -> Result<Vec<FlowRecord>, DecodeError> {
        self.decode_at(payload, exporter, Utc::now())
    }

    /// `now` stamps records whose wire format carries no usable flow time (sFlow).
    pub fn decode_at(
        &mut self,
        payload: &[u8],
        exporter: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>, DecodeError> {
        let mut stats = DecodeStats {
            parse_attempts: 1,
            ..Default::default()
        };

        let result = self.dispatch(payload, exporter, now, &mut stats);
        match &result {
            Ok(records) => {
                stats.parsed_packets += 1;
                stats.decoded_records += records.len() as u64;
            }
            Err(err) if err.is_template_error() => stats.template_errors += 1,
            Err(_) => stats.parse_errors += 1,
        }

        self.stats.merge(&stats);
        self.last = stats;
        result
    }

    fn dispatch(
        &mut self,
        payload: &[u8],
        exporter: IpAddr,
        now: DateTime<Utc>,
        stats: &mut DecodeStats,
    ) -> Result<Vec<FlowRecord>, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::PayloadTooShort { len: payload.len() });
        }

        // With sFlow disabled its version word is read like any other
        // header and rejected as version 0.
        if is_sflow_payload(payload) && self.protocols.sflow {
            stats.sflow_datagrams += 1;
            return sflow::decode(payload, exporter, now);
        }

        let version = u16::from_be_bytes([payload[0], payload[1]]);
        let enabled = match version {
            5 => self.protocols.v5,
            9 => self.protocols.v9,
            10 => self.protocols.ipfix,
            other => return Err(DecodeError::UnsupportedVersion(other)),
        };
        if !enabled {
            stats.disabled_protocol_packets += 1;
            return Ok(Vec::new());
        }

        match version {
            5 => {
                stats.netflow_v5_packets += 1;
                netflow_v5::decode(payload, exporter, &mut self.templates)
            }
            9 => {
                stats.netflow_v9_packets += 1;
                templated::decode(payload, exporter, Dialect::V9, &mut self.templates)
            }
            _ => {
                stats.ipfix_packets += 1;
                templated::decode(payload, exporter, Dialect::Ipfix, &mut self.templates)
            }
        }
    }

    /// Running totals since construction.
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Counters of the most recent `decode` call alone.
    pub fn last_stats(&self) -> DecodeStats {
        self.last
    }

    /// Exporters that currently hold a parser scope.
    pub fn template_exporters(&self) -> usize {
        self.templates.len()
    }

    pub fn template_count(&self) -> usize {
        self.templates.template_count()
    }

    pub fn template_evictions(&self) -> u64 {
        self.templates.evictions()
    }
}

fn is_sflow_payload(payload: &[u8]) -> bool {
    payload.len() >= 4
        && u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) == sflow::SFLOW_VERSION
}

pub(crate) fn timestamp_from_millis(millis: u64) -> Option<DateTime<Utc>> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
