//! netflow-collector standalone binary

use netflow_collector::aggregator::FlowTotals;
use netflow_collector::collector::Collector;
use netflow_collector::config::CollectorConfig;
use netflow_collector::tracing_setup::init_tracing;
use serde::Serialize;
use std::io::Write;
use tokio::time::MissedTickBehavior;

/// Per-second rates derived from the newest bucket, one JSON line per tick.
#[derive(Debug, Serialize)]
struct RateSample {
    timestamp: String,
    bytes_per_sec: f64,
    packets_per_sec: f64,
    flows_per_sec: f64,
    dropped: u64,
}

impl RateSample {
    fn from_totals(totals: &FlowTotals) -> Option<Self> {
        let secs = totals.duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(Self {
            timestamp: totals.timestamp.to_rfc3339(),
            bytes_per_sec: totals.bytes as f64 / secs,
            packets_per_sec: totals.packets as f64 / secs,
            flows_per_sec: totals.flows as f64 / secs,
            dropped: totals.dropped,
        })
    }
}

fn emit(sample: &RateSample) {
    match serde_json::to_string(sample) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
                tracing::warn!("failed to write rate sample: {}", err);
            }
        }
        Err(err) => tracing::warn!("failed to serialize rate sample: {}", err),
    }
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = match CollectorConfig::new() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("failed to load configuration: {err:#}");
            std::process::exit(1);
        }
    };

    let mut collector = match Collector::start(&config).await {
        Ok(collector) => collector,
        Err(err) => {
            tracing::error!("failed to start flow collector: {err:#}");
            std::process::exit(1);
        }
    };

    let mut tick = tokio::time::interval(config.aggregation.update_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::error!("failed to listen for shutdown signal: {}", err);
                }
                tracing::info!("shutdown requested");
                break;
            }
            _ = tick.tick() => {
                let totals = collector.latest_totals();
                if let Some(sample) = RateSample::from_totals(&totals) {
                    emit(&sample);
                }
            }
        }
    }

    collector.stop().await;

    let snapshot = collector.snapshot("local");
    tracing::info!(
        buckets = snapshot.buckets.len(),
        exporters = snapshot.exporters.len(),
        records_total = snapshot.metrics.get("records_total").copied().unwrap_or(0),
        decode_errors = snapshot.metrics.get("decode_errors").copied().unwrap_or(0),
        "final flow snapshot"
    );
}
