//! Flow-export collector: NetFlow v5/v9, IPFIX and sFlow datagrams are
//! decoded into [`flow::FlowRecord`]s and aggregated into fixed-width time
//! buckets that can be read through [`collector::Collector::snapshot`] and
//! [`collector::Collector::latest_totals`].

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod decoder;
pub mod error;
pub mod flow;
pub mod listener;
pub mod netdata_env;
pub mod tracing_setup;
