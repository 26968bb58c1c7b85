use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Namespace shared by every metric the process exposes.
pub const NAMESPACE: &str = "costmeter";

/// Prometheus metrics for the cost calculation pipeline.
///
/// All metrics use the "costmeter" namespace. Metrics whose label set
/// depends on configuration (the per-dimension cost counter) are
/// registered later through [`HealthMetrics::registry`].
pub struct HealthMetrics {
    registry: Registry,
    addr: String,

    // === Calculation ===
    /// Calculation cycles by status (succeeded/failed).
    pub cycles: CounterVec,
    /// Difference between the actual and configured interval, in milliseconds.
    pub lag_milliseconds: Gauge,
    /// Wall time of one calculation cycle.
    pub cycle_duration: Histogram,
    /// Cost items generated by strategy.
    pub cost_items: CounterVec,

    // === Export ===
    /// Records dropped because an exporter failed, by exporter.
    pub export_errors: CounterVec,
    /// Records currently held by a buffering exporter.
    pub buffered_records: GaugeVec,
    /// Total buffer flushes.
    pub buffer_flushes: Counter,
    /// Duration of one downstream batch write, by exporter.
    pub export_batch_duration: HistogramVec,

    // === Inventory ===
    /// Failed snapshot reloads by source (pods/nodes).
    pub inventory_sync_errors: CounterVec,
    /// Objects currently cached by source.
    pub inventory_objects: GaugeVec,

    // === Aggregate mode ===
    /// Ingested records by status (accepted/failed). Undecodable requests
    /// count once as rejected.
    pub aggregate_consumed: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = CounterVec::new(
            Opts::new("cycles_total", "Cost calculation cycles by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let lag_milliseconds = Gauge::with_opts(
            Opts::new(
                "lag_milliseconds",
                "Lag between the configured and actual calculation interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Duration of one calculation cycle including export.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let cost_items = CounterVec::new(
            Opts::new("cost_items_total", "Cost items generated by strategy.")
                .namespace(NAMESPACE),
            &["strategy"],
        )?;

        let export_errors = CounterVec::new(
            Opts::new(
                "export_errors_total",
                "Cost records dropped due to exporter errors.",
            )
            .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let buffered_records = GaugeVec::new(
            Opts::new(
                "buffered_records",
                "Merged cost records waiting for the next flush.",
            )
            .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let buffer_flushes = Counter::with_opts(
            Opts::new("buffer_flushes_total", "Total buffering exporter flushes.")
                .namespace(NAMESPACE),
        )?;
        let export_batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "export_batch_duration_seconds",
                "Duration of one downstream batch write.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["exporter"],
        )?;

        let inventory_sync_errors = CounterVec::new(
            Opts::new(
                "inventory_sync_errors_total",
                "Failed inventory snapshot reloads by source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let inventory_objects = GaugeVec::new(
            Opts::new("inventory_objects", "Objects cached per inventory source.")
                .namespace(NAMESPACE),
            &["source"],
        )?;

        let aggregate_consumed = CounterVec::new(
            Opts::new(
                "aggregate_consumed_total",
                "Cost records ingested in aggregate mode by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(lag_milliseconds.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(cost_items.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(buffered_records.clone()))?;
        registry.register(Box::new(buffer_flushes.clone()))?;
        registry.register(Box::new(export_batch_duration.clone()))?;
        registry.register(Box::new(inventory_sync_errors.clone()))?;
        registry.register(Box::new(inventory_objects.clone()))?;
        registry.register(Box::new(aggregate_consumed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            cycles,
            lag_milliseconds,
            cycle_duration,
            cost_items,
            export_errors,
            buffered_records,
            buffer_flushes,
            export_batch_duration,
            inventory_sync_errors,
            inventory_objects,
            aggregate_consumed,
        })
    }

    /// Registry for metrics created outside this struct.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Routes serving /metrics and /healthz.
    pub fn router(&self) -> Router {
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state)
    }

    /// Serves /metrics and /healthz until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        serve_router(&self.addr, self.router(), cancel).await
    }

    /// Serves the health routes merged with `extra` until `cancel` fires.
    pub async fn serve_with(&self, extra: Router, cancel: CancellationToken) -> Result<()> {
        serve_router(&self.addr, self.router().merge(extra), cancel).await
    }
}

/// Expands the ":port" shorthand to a bindable address.
pub fn bind_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":5000" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Binds `addr` and serves `app` with graceful shutdown on `cancel`.
pub async fn serve_router(addr: &str, app: Router, cancel: CancellationToken) -> Result<()> {
    let bind_addr = bind_addr(addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;
    tracing::info!(addr = %local_addr, "http server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
    })
    .await
    .context("serving http")?;

    tracing::info!(addr = %local_addr, "http server stopped");

    Ok(())
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
