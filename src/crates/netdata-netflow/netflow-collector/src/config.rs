use crate::decoder::ProtocolSet;
use crate::netdata_env::NetdataEnv;
use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "netflow.yaml";

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| {
        format!(
            "invalid duration '{}' (examples: '1s', '10s', '1m'): {}",
            value, e
        )
    })
}

fn parse_bytesize(value: &str) -> Result<ByteSize, String> {
    value.parse().map_err(|e| {
        format!(
            "invalid size '{}' (examples: '0', '4MiB', '16MB'): {}",
            value, e
        )
    })
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    #[arg(long = "netflow-listen", default_value = "0.0.0.0:2055")]
    pub listen: String,

    /// Size of the datagram read buffer; larger datagrams are truncated.
    #[arg(long = "netflow-max-packet-size", default_value_t = 9216)]
    pub max_packet_size: usize,

    /// Socket receive buffer; 0 keeps the operating system default.
    #[arg(
        long = "netflow-receive-buffer",
        default_value = "0",
        value_parser = parse_bytesize
    )]
    pub receive_buffer: ByteSize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2055".to_string(),
            max_packet_size: 9216,
            receive_buffer: ByteSize::b(0),
        }
    }
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolsConfig {
    #[arg(long = "netflow-enable-v5", action = ArgAction::Set, default_value_t = true)]
    pub v5: bool,

    #[arg(long = "netflow-enable-v9", action = ArgAction::Set, default_value_t = true)]
    pub v9: bool,

    #[arg(long = "netflow-enable-ipfix", action = ArgAction::Set, default_value_t = true)]
    pub ipfix: bool,

    #[arg(long = "netflow-enable-sflow", action = ArgAction::Set, default_value_t = true)]
    pub sflow: bool,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            v5: true,
            v9: true,
            ipfix: true,
            sflow: true,
        }
    }
}

impl ProtocolsConfig {
    pub fn protocol_set(&self) -> ProtocolSet {
        ProtocolSet {
            v5: self.v5,
            v9: self.v9,
            ipfix: self.ipfix,
            sflow: self.sflow,
        }
    }

    fn any_enabled(&self) -> bool {
        self.v5 || self.v9 || self.ipfix || self.sflow
    }
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
    #[arg(
        long = "netflow-update-every",
        default_value = "1s",
        value_parser = parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub update_every: Duration,

    /// Bucket width; defaults to `update_every`.
    #[arg(long = "netflow-bucket-duration", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub bucket_duration: Option<Duration>,

    #[arg(long = "netflow-max-buckets", default_value_t = 60)]
    pub max_buckets: usize,

    /// Distinct flow keys per bucket; 0 removes the limit.
    #[arg(long = "netflow-max-keys", default_value_t = 10_000)]
    pub max_keys: usize,

    #[arg(long = "netflow-default-sampling-rate", default_value_t = 1)]
    pub default_sampling_rate: u64,

    #[arg(long = "netflow-max-template-exporters", default_value_t = 1024)]
    pub max_template_exporters: usize,

    /// Records older than this are moved to the current bucket. Defaults to
    /// `max_buckets * bucket_duration`.
    #[arg(long = "netflow-stale-after", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub stale_after: Option<Duration>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            update_every: Duration::from_secs(1),
            bucket_duration: None,
            max_buckets: 60,
            max_keys: 10_000,
            default_sampling_rate: 1,
            max_template_exporters: 1024,
            stale_after: None,
        }
    }
}

/// Static per-exporter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    pub ip: String,
    pub name: String,
    /// Used when the exporter does not report a rate; 0 means unset.
    pub sampling_rate: u64,
}

#[derive(Debug, Parser, Clone, Default, Serialize, Deserialize)]
#[command(name = "netflow-collector")]
#[command(about = "NetFlow/IPFIX/sFlow collector with time-bucketed aggregation")]
#[command(version = "0.1")]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[command(flatten)]
    #[serde(default, rename = "listener")]
    pub listener: ListenerConfig,

    #[command(flatten)]
    #[serde(default, rename = "protocols")]
    pub protocols: ProtocolsConfig,

    #[command(flatten)]
    #[serde(default, rename = "aggregation")]
    pub aggregation: AggregationConfig,

    #[arg(skip)]
    #[serde(default, rename = "exporters")]
    pub exporters: Vec<ExporterConfig>,

    #[arg(hide = true, help = "Collection interval in seconds")]
    #[serde(skip)]
    pub update_frequency: Option<u64>,
}

impl CollectorConfig {
    pub fn new() -> Result<Self> {
        let netdata_env = NetdataEnv::from_environment();

        let mut cfg = if netdata_env.running_under_netdata() {
            Self::load_from_netdata_config(&netdata_env)?
        } else {
            Self::parse()
        };

        if let Some(secs) = cfg.update_frequency.or(netdata_env.update_every)
            && secs > 0
        {
            cfg.aggregation.update_every = Duration::from_secs(secs);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn load_from_netdata_config(netdata_env: &NetdataEnv) -> Result<Self> {
        let candidates = [
            netdata_env
                .user_config_dir
                .as_ref()
                .map(|p| p.join(CONFIG_FILE_NAME)),
            netdata_env
                .stock_config_dir
                .as_ref()
                .map(|p| p.join(CONFIG_FILE_NAME)),
        ];

        for path in candidates.into_iter().flatten() {
            if path.is_file() {
                return Self::from_yaml_file(&path).with_context(|| {
                    format!("failed to load netflow config from {}", path.display())
                });
            }
        }

        Ok(Self::default())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg = serde_yaml::from_str::<Self>(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.max_packet_size == 0 || self.listener.max_packet_size > 65_535 {
            anyhow::bail!("listener.max_packet_size must be between 1 and 65535");
        }

        self.listen_addr()?;

        if !self.protocols.any_enabled() {
            anyhow::bail!("at least one protocol must be enabled");
        }
        if self.aggregation.update_every.is_zero() {
            anyhow::bail!("aggregation.update_every must be greater than 0");
        }

        let mut seen = HashSet::new();
        for exporter in &self.exporters {
            let ip = exporter
                .ip
                .trim()
                .parse::<IpAddr>()
                .with_context(|| format!("invalid exporter ip: {}", exporter.ip))?;
            if !seen.insert(ip) {
                anyhow::bail!("exporter {} is configured more than once", ip);
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listener
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listener address: {}", self.listener.listen))
    }

    /// Aggregation bucket width, falling back to the update interval.
    pub fn bucket_duration(&self) -> Duration {
        self.aggregation
            .bucket_duration
            .filter(|d| !d.is_zero())
            .unwrap_or(self.aggregation.update_every)
    }
}
