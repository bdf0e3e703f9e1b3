//! HTTP observability surface: `/metrics` (Prometheus exposition) and
//! `/health`. Ported from the teacher's `ObservabilityServer` in
//! `examples/tangle-network-blueprint/crates/manager/src/observability.rs`
//! (axum `Router` + `prometheus::Registry`/`Gauge`/`TextEncoder`), with the
//! dashboard-blueprint-count gauges replaced by the driver's own resource
//! report fields.

use crate::model::ComputeNodeReport;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct ObservabilityServer {
    registry: Registry,
    vcpus: Gauge,
    vcpus_used: Gauge,
    memory_mb: Gauge,
    memory_mb_used: Gauge,
    local_gb: Gauge,
    local_gb_used: Gauge,
    port: u16,
}

impl ObservabilityServer {
    pub fn new(port: u16) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let vcpus = Gauge::with_opts(Opts::new("compute_driver_vcpus", "Host logical CPU count"))?;
        let vcpus_used = Gauge::with_opts(Opts::new(
            "compute_driver_vcpus_used",
            "vCPUs pinned across running domains",
        ))?;
        let memory_mb = Gauge::with_opts(Opts::new("compute_driver_memory_mb", "Total host memory, MB"))?;
        let memory_mb_used = Gauge::with_opts(Opts::new(
            "compute_driver_memory_mb_used",
            "Used host memory, MB",
        ))?;
        let local_gb = Gauge::with_opts(Opts::new(
            "compute_driver_local_gb",
            "Total instances-path disk capacity, GB",
        ))?;
        let local_gb_used = Gauge::with_opts(Opts::new(
            "compute_driver_local_gb_used",
            "Used instances-path disk capacity, GB",
        ))?;

        for metric in [&vcpus, &vcpus_used, &memory_mb, &memory_mb_used, &local_gb, &local_gb_used] {
            registry.register(Box::new(metric.clone()))?;
        }

        Ok(Self {
            registry,
            vcpus,
            vcpus_used,
            memory_mb,
            memory_mb_used,
            local_gb,
            local_gb_used,
            port,
        })
    }

    /// Updates every gauge from a freshly-computed report. Called on the
    /// same interval the driver feeds reports to `InstanceStore`.
    pub fn observe(&self, report: &ComputeNodeReport) {
        self.vcpus.set(f64::from(report.vcpus));
        self.vcpus_used.set(f64::from(report.vcpus_used));
        self.memory_mb.set(report.memory_mb as f64);
        self.memory_mb_used.set(report.memory_mb_used as f64);
        self.local_gb.set(report.local_gb as f64);
        self.local_gb_used.set(report.local_gb_used as f64);
    }

    pub async fn serve(self: Arc<Self>) -> crate::error::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .route("/health", axum::routing::get(health_handler))
            .with_state(self);

        info!(%addr, "observability server listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::Error::External(format!("observability server: {e}")))
    }

    fn collect(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("prometheus text encoding is infallible for well-formed gauges");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid utf-8")
    }
}

async fn metrics_handler(
    axum::extract::State(server): axum::extract::State<Arc<ObservabilityServer>>,
) -> impl axum::response::IntoResponse {
    server.collect()
}

async fn health_handler() -> impl axum::response::IntoResponse {
    "OK"
}
