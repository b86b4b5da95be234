//! Listener and aggregator wired together behind the two read interfaces.

use crate::aggregator::{Aggregator, FlowData, FlowTotals};
use crate::config::CollectorConfig;
use crate::listener::Listener;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug)]
pub struct Collector {
    aggregator: Arc<Aggregator>,
    listener: Listener,
}

impl Collector {
    pub async fn start(cfg: &CollectorConfig) -> Result<Self> {
        let aggregator = Arc::new(
            Aggregator::new(
                cfg.bucket_duration(),
                cfg.aggregation.max_buckets,
                cfg.aggregation.max_keys,
                cfg.aggregation.default_sampling_rate,
                &cfg.exporters,
            )
            .with_stale_after(cfg.aggregation.stale_after),
        );
        let listener = Listener::start(cfg, Arc::clone(&aggregator)).await?;

        tracing::info!(
            bucket_duration = ?aggregator.bucket_duration(),
            max_buckets = cfg.aggregation.max_buckets,
            max_keys = cfg.aggregation.max_keys,
            exporters = cfg.exporters.len(),
            "flow collector started"
        );

        Ok(Self {
            aggregator,
            listener,
        })
    }

    /// Point-in-time view of every bucket, with ingest counters merged
    /// into `metrics`.
    pub fn snapshot(&self, agent_id: &str) -> FlowData {
        let mut data = self.aggregator.snapshot(agent_id);
        data.metrics.extend(self.listener.metrics().snapshot());
        data
    }

    pub fn latest_totals(&self) -> FlowTotals {
        self.aggregator.latest_totals()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub async fn stop(&mut self) {
        self.listener.stop().await;
        tracing::info!("flow collector stopped");
    }
}
