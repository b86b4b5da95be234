//! Protocol-agnostic flow model shared by the decoders and the aggregator.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub const DIRECTION_UNDEFINED: &str = "undefined";
pub const DIRECTION_INGRESS: &str = "ingress";
pub const DIRECTION_EGRESS: &str = "egress";

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Undefined,
    Ingress,
    Egress,
}

impl Direction {
    /// Maps the v9/IPFIX `flowDirection` value (0 = ingress, 1 = egress).
    pub fn from_wire(value: u64) -> Self {
        match value {
            0 => Self::Ingress,
            1 => Self::Egress,
            _ => Self::Undefined,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => DIRECTION_UNDEFINED,
            Self::Ingress => DIRECTION_INGRESS,
            Self::Egress => DIRECTION_EGRESS,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire dialect a record was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowVersion {
    V5,
    V9,
    Ipfix,
    Sflow,
}

impl FlowVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V5 => "v5",
            Self::V9 => "v9",
            Self::Ipfix => "ipfix",
            Self::Sflow => "sflow",
        }
    }
}

impl fmt::Display for FlowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation identity of a flow. Exporter and direction are kept outside the
/// key so the same conversation seen by two exporters stays distinguishable.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FlowKey {
    pub src_prefix: String,
    pub dst_prefix: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub src_as: u32,
    pub dst_as: u32,
    pub in_if: u32,
    pub out_if: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    /// Flow end time, or the best approximation the exporter gave us.
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub key: FlowKey,
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
    pub raw_bytes: u64,
    pub raw_packets: u64,
    /// 0 means "not reported"; the aggregator resolves the effective rate.
    pub sampling_rate: u64,
    pub direction: Direction,
    pub exporter_ip: String,
    pub version: Option<FlowVersion>,
}

impl FlowRecord {
    pub fn new(exporter_ip: impl Into<String>, version: FlowVersion) -> Self {
        Self {
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            key: FlowKey::default(),
            bytes: 0,
            packets: 0,
            flows: 1,
            raw_bytes: 0,
            raw_packets: 0,
            sampling_rate: 0,
            direction: Direction::Undefined,
            exporter_ip: exporter_ip.into(),
            version: Some(version),
        }
    }
}

/// Formats an address with its prefix length, e.g. `10.1.2.3/24`.
///
/// A zero or out-of-range mask yields the bare address.
pub fn ip_with_prefix(ip: IpAddr, mask: u8) -> String {
    if mask == 0 {
        return ip.to_string();
    }
    match IpNet::new(ip, mask) {
        Ok(net) => net.to_string(),
        Err(_) => ip.to_string(),
    }
}
