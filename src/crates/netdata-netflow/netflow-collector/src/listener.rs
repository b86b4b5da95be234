use crate::aggregator::Aggregator;
use crate::config::CollectorConfig;
use crate::decoder::{DecodeStats, FlowDecoder};
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ingestion counters, updated by the read loop and read from anywhere.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub udp_packets_received: AtomicU64,
    pub udp_bytes_received: AtomicU64,
    pub udp_recv_errors: AtomicU64,
    pub parse_attempts: AtomicU64,
    pub parsed_packets: AtomicU64,
    pub parse_errors: AtomicU64,
    pub template_errors: AtomicU64,
    pub disabled_protocol_packets: AtomicU64,
    pub netflow_v5_packets: AtomicU64,
    pub netflow_v9_packets: AtomicU64,
    pub ipfix_packets: AtomicU64,
    pub sflow_datagrams: AtomicU64,
    pub decoded_records: AtomicU64,
}

impl IngestMetrics {
    pub fn apply_decode_stats(&self, stats: &DecodeStats) {
        self.parse_attempts
            .fetch_add(stats.parse_attempts, Ordering::Relaxed);
        self.parsed_packets
            .fetch_add(stats.parsed_packets, Ordering::Relaxed);
        self.parse_errors
            .fetch_add(stats.parse_errors, Ordering::Relaxed);
        self.template_errors
            .fetch_add(stats.template_errors, Ordering::Relaxed);
        self.disabled_protocol_packets
            .fetch_add(stats.disabled_protocol_packets, Ordering::Relaxed);
        self.netflow_v5_packets
            .fetch_add(stats.netflow_v5_packets, Ordering::Relaxed);
        self.netflow_v9_packets
            .fetch_add(stats.netflow_v9_packets, Ordering::Relaxed);
        self.ipfix_packets
            .fetch_add(stats.ipfix_packets, Ordering::Relaxed);
        self.sflow_datagrams
            .fetch_add(stats.sflow_datagrams, Ordering::Relaxed);
        self.decoded_records
            .fetch_add(stats.decoded_records, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("udp_packets_received", &self.udp_packets_received),
            ("udp_bytes_received", &self.udp_bytes_received),
            ("udp_recv_errors", &self.udp_recv_errors),
            ("decoded_parse_attempts", &self.parse_attempts),
            ("decoded_parsed_packets", &self.parsed_packets),
            ("decoded_parse_errors", &self.parse_errors),
            ("decoded_template_errors", &self.template_errors),
            ("decoded_disabled_protocol", &self.disabled_protocol_packets),
            ("decoded_netflow_v5", &self.netflow_v5_packets),
            ("decoded_netflow_v9", &self.netflow_v9_packets),
            ("decoded_ipfix", &self.ipfix_packets),
            ("decoded_sflow", &self.sflow_datagrams),
            ("decoded_records", &self.decoded_records),
        ];
        counters
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Owns the UDP socket and the single task that decodes and aggregates.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    metrics: Arc<IngestMetrics>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds the socket and spawns the read loop. Must be called inside a
    /// tokio runtime.
    pub async fn start(cfg: &CollectorConfig, aggregator: Arc<Aggregator>) -> Result<Self> {
        let listen = cfg.listen_addr()?;
        let socket = bind_socket(listen, cfg.listener.receive_buffer.as_u64())
            .with_context(|| format!("failed to bind {}", listen))?;
        let local_addr = socket
            .local_addr()
            .context("failed to read bound listener address")?;

        let decoder = FlowDecoder::new(
            cfg.protocols.protocol_set(),
            cfg.aggregation.max_template_exporters,
        );
        let metrics = Arc::new(IngestMetrics::default());
        let shutdown = CancellationToken::new();

        let read_loop = ReadLoop {
            socket,
            buffer: vec![0_u8; cfg.listener.max_packet_size],
            decoder,
            aggregator,
            metrics: Arc::clone(&metrics),
        };
        let task = tokio::spawn(read_loop.run(shutdown.clone()));

        tracing::info!("listening for flow datagrams on {}", local_addr);

        Ok(Self {
            local_addr,
            metrics,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Cancels the read loop and waits for it to exit. The socket is closed
    /// when the loop drops it.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            tracing::error!("flow listener task failed: {}", err);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn bind_socket(addr: SocketAddr, receive_buffer: u64) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create udp socket")?;

    if receive_buffer > 0 {
        let size = usize::try_from(receive_buffer).unwrap_or(usize::MAX);
        if let Err(err) = SockRef::from(&socket).set_recv_buffer_size(size) {
            tracing::warn!(
                "failed to set udp receive buffer to {} bytes: {}",
                receive_buffer,
                err
            );
        }
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

struct ReadLoop {
    socket: UdpSocket,
    buffer: Vec<u8>,
    decoder: FlowDecoder,
    aggregator: Arc<Aggregator>,
    metrics: Arc<IngestMetrics>,
}

impl ReadLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                recv = self.socket.recv_from(&mut self.buffer) => {
                    let (received, source) = match recv {
                        Ok(result) => result,
                        Err(err) => {
                            self.metrics.udp_recv_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("udp recv error: {}", err);
                            continue;
                        }
                    };

                    if received == 0 {
                        continue;
                    }

                    self.metrics.udp_packets_received.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .udp_bytes_received
                        .fetch_add(received as u64, Ordering::Relaxed);

                    self.handle_datagram(received, source);
                }
            }
        }

        tracing::info!(
            templates = self.decoder.template_count(),
            template_exporters = self.decoder.template_exporters(),
            template_evictions = self.decoder.template_evictions(),
            "flow listener stopped after {} datagrams",
            self.metrics.udp_packets_received.load(Ordering::Relaxed)
        );
    }

    fn handle_datagram(&mut self, received: usize, source: SocketAddr) {
        let result = self.decoder.decode(&self.buffer[..received], source.ip());
        self.metrics.apply_decode_stats(&self.decoder.last_stats());

        match result {
            Ok(records) if records.is_empty() => {}
            Ok(records) => self.aggregator.add_records(&records),
            Err(err) => {
                self.aggregator.record_decode_error();
                tracing::debug!("dropping datagram from {}: {}", source, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test_packets::{V5Record, v5_packet};
    use std::time::Duration;

    fn test_config() -> CollectorConfig {
        let mut cfg = CollectorConfig::default();
        cfg.listener.listen = "127.0.0.1:0".to_string();
        cfg.aggregation.bucket_duration = Some(Duration::from_secs(1));
        cfg.aggregation.max_buckets = 2;
        cfg.aggregation.max_keys = 100;
        cfg
    }

    fn test_aggregator(cfg: &CollectorConfig) -> Arc<Aggregator> {
        Arc::new(Aggregator::new(
            cfg.bucket_duration(),
            cfg.aggregation.max_buckets,
            cfg.aggregation.max_keys,
            cfg.aggregation.default_sampling_rate,
            &cfg.exporters,
        ))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn v5_datagram_reaches_the_aggregator() {
        let cfg = test_config();
        let aggregator = test_aggregator(&cfg);
        let mut listener = Listener::start(&cfg, Arc::clone(&aggregator))
            .await
            .expect("start listener");

        let now = chrono::Utc::now().timestamp() as u32;
        let packet = v5_packet(now, 100, &[V5Record::default()]);
        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        sender
            .send_to(&packet, listener.local_addr())
            .await
            .expect("send");

        assert!(wait_for(|| !aggregator.snapshot("agent-1").buckets.is_empty()).await);

        let data = aggregator.snapshot("agent-1");
        assert_eq!(data.summaries["total_bytes"], 1000 * 100);
        assert_eq!(data.summaries["total_packets"], 100 * 100);
        assert_eq!(data.exporters.len(), 1);
        assert_eq!(data.exporters[0].ip, "127.0.0.1");

        let metrics = listener.metrics().snapshot();
        assert_eq!(metrics["udp_packets_received"], 1);
        assert_eq!(metrics["decoded_netflow_v5"], 1);

        listener.stop().await;
    }

    #[tokio::test]
    async fn undecodable_datagram_counts_a_decode_error() {
        let cfg = test_config();
        let aggregator = test_aggregator(&cfg);
        let mut listener = Listener::start(&cfg, Arc::clone(&aggregator))
            .await
            .expect("start listener");

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        sender
            .send_to(&[0, 7, 0, 0], listener.local_addr())
            .await
            .expect("send");

        assert!(wait_for(|| aggregator.stats().decode_errors == 1).await);
        assert!(aggregator.snapshot("agent-1").buckets.is_empty());
        assert_eq!(listener.metrics().snapshot()["decoded_parse_errors"], 1);

        listener.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let cfg = test_config();
        let aggregator = test_aggregator(&cfg);
        let first = Listener::start(&cfg, Arc::clone(&aggregator))
            .await
            .expect("start listener");

        let mut taken = cfg.clone();
        taken.listener.listen = first.local_addr().to_string();
        let err = Listener::start(&taken, aggregator)
            .await
            .expect_err("address in use");
        assert!(err.to_string().contains("failed to bind"));
    }

    #[tokio::test]
    async fn stop_joins_the_read_loop() {
        let cfg = test_config();
        let aggregator = test_aggregator(&cfg);
        let mut listener = Listener::start(&cfg, aggregator)
            .await
            .expect("start listener");

        tokio::time::timeout(Duration::from_secs(2), listener.stop())
            .await
            .expect("stop completes");
        assert!(listener.task.is_none());
    }
}
