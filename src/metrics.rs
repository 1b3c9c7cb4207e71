//! Live gauges for the worker pool.
//!
//! The publisher owns its own [`Registry`] so several supervisors (or tests)
//! can coexist in one process. Values are pushed from the output readers and
//! the supervisor; a scrape only reads them, so it may lag the newest parse by
//! up to one update.

use crate::error::PerfError;
use crate::parser::ParseEvent;
use crate::ports::is_port_in_use;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct MetricsPublisher {
    registry: Registry,
    active_threads: IntGauge,
    port_binary: IntGaugeVec,
    thread_core: IntGaugeVec,
    respawns: IntGaugeVec,
    bw_gbps: GaugeVec,
    msg_rate_mpps: GaugeVec,
    lat_avg_usec: GaugeVec,
    rkey: GaugeVec,
    vaddr: GaugeVec,
}

fn int_gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec, PerfError> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec, PerfError> {
    let gauge = GaugeVec::new(Opts::new(name, help), &["port"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Hex string such as `0x1a2b` as a gauge value.
///
/// Gauges are `f64`, so values above 2^53 lose their low bits. RKeys are
/// 32-bit and user-space VAddrs fit in 48 bits on current hardware, so both
/// are exact in practice. Bandwidth JSON logs keep the original hex strings.
fn hex_value(hex: &str) -> Option<f64> {
    let digits = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")).unwrap_or(hex);
    u64::from_str_radix(digits, 16).ok().map(|v| v as f64)
}

impl MetricsPublisher {
    pub fn new() -> Result<Self, PerfError> {
        let registry = Registry::new();

        let active_threads = IntGauge::new("rdma_active_threads", "Number of live benchmark workers")?;
        registry.register(Box::new(active_threads.clone()))?;

        Ok(Self {
            active_threads,
            port_binary: int_gauge_vec(
                &registry,
                "rdma_server_port_binary",
                "Benchmark binary bound to a port",
                &["port", "binary"],
            )?,
            thread_core: int_gauge_vec(
                &registry,
                "rdma_server_thread_core",
                "CPU core a port's worker is pinned to",
                &["port", "core"],
            )?,
            respawns: int_gauge_vec(
                &registry,
                "rdma_server_thread_respawns",
                "Times the worker on a port has been respawned",
                &["port"],
            )?,
            bw_gbps: gauge_vec(&registry, "rdma_port_bw_gbps", "Average bandwidth in Gb/s")?,
            msg_rate_mpps: gauge_vec(&registry, "rdma_port_msg_rate_mpps", "Message rate in Mpps")?,
            lat_avg_usec: gauge_vec(&registry, "rdma_port_lat_avg_usec", "Average latency in usec")?,
            rkey: gauge_vec(&registry, "rdma_port_rkey", "Last seen RKey")?,
            vaddr: gauge_vec(&registry, "rdma_port_vaddr", "Last seen VAddr")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_active(&self, count: usize) {
        self.active_threads.set(count as i64);
    }

    /// Publish the identity of the worker on `port`.
    pub fn register_slot(&self, port: u16, core: usize, binary: &str) {
        let port = port.to_string();
        self.port_binary.with_label_values(&[&port, binary]).set(1);
        self.thread_core
            .with_label_values(&[&port, &core.to_string()])
            .set(core as i64);
    }

    pub fn set_respawns(&self, port: u16, count: u32) {
        self.respawns
            .with_label_values(&[&port.to_string()])
            .set(i64::from(count));
    }

    /// Fold one parsed line from the worker on `port` into the gauges.
    pub fn observe(&self, port: u16, event: &ParseEvent) {
        let label = port.to_string();
        match event {
            ParseEvent::Bandwidth(s) => {
                self.bw_gbps.with_label_values(&[&label]).set(s.bw_avg_gbps);
                self.msg_rate_mpps.with_label_values(&[&label]).set(s.msg_rate_mpps);
            }
            ParseEvent::Latency(s) => {
                self.lat_avg_usec.with_label_values(&[&label]).set(s.t_avg_usec);
            }
            ParseEvent::Connection(conn) => {
                if let Some(v) = hex_value(&conn.rkey) {
                    self.rkey.with_label_values(&[&label]).set(v);
                }
                if let Some(v) = hex_value(&conn.vaddr) {
                    self.vaddr.with_label_values(&[&label]).set(v);
                }
            }
            _ => {}
        }
    }

    /// Prometheus text exposition of every gauge.
    pub fn encode(&self) -> Result<String, PerfError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PerfError::Metrics(e.to_string()))
    }
}

async fn metrics_handler(State(publisher): State<Arc<MetricsPublisher>>) -> impl IntoResponse {
    match publisher.encode() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn create_router(publisher: Arc<MetricsPublisher>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(publisher)
}

/// Serve `/metrics` on `port` until `shutdown` flips to true.
///
/// Returns `None` without binding when something already answers on the
/// port, so a second supervisor on the same host reuses the first endpoint.
pub fn spawn_endpoint(
    publisher: Arc<MetricsPublisher>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if is_port_in_use(port) {
        warn!("Port {} already in use; not starting metrics endpoint", port);
        return None;
    }

    let router = create_router(publisher);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting Prometheus endpoint on port {}", port);

    Some(tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to bind metrics endpoint on {}: {}", addr, e);
                return;
            }
        };
        let stop = async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stop).await {
            warn!("Metrics endpoint stopped: {}", e);
        }
    }))
}
