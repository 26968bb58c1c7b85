use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tracing::{error, warn};

use crate::coster::exporter::CostExporter;
use crate::coster::record::CostRecord;
use crate::export::codec::decompress;
use crate::export::health::HealthMetrics;

/// Path accepting NDJSON cost records.
pub const INGEST_PATH: &str = "/v1/costs";

struct IngestState {
    exporter: Arc<CostExporter>,
    health: Arc<HealthMetrics>,
    max_body_bytes: usize,
}

/// Routes accepting cost records produced by collectors and handing them to
/// `exporter`.
///
/// A request is acknowledged only once the whole batch has been accepted
/// downstream, so a collector may retry a failed request without losing
/// records.
pub fn router(exporter: Arc<CostExporter>, health: Arc<HealthMetrics>, max_body_bytes: usize) -> Router {
    let state = Arc::new(IngestState {
        exporter,
        health,
        max_body_bytes,
    });

    Router::new()
        .route(INGEST_PATH, post(ingest_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn ingest_handler(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    let records = match decompress(&body, encoding).and_then(|data| {
        if data.len() > state.max_body_bytes {
            anyhow::bail!("decoded body exceeds {} bytes", state.max_body_bytes);
        }
        decode_ndjson(&data)
    }) {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "rejecting cost batch");
            state
                .health
                .aggregate_consumed
                .with_label_values(&["rejected"])
                .inc();
            return (StatusCode::BAD_REQUEST, format!("{e:#}"));
        }
    };

    let count = records.len();
    match state.exporter.export_batch(records).await {
        Ok(()) => {
            state
                .health
                .aggregate_consumed
                .with_label_values(&["accepted"])
                .inc_by(count as f64);
            (StatusCode::OK, String::new())
        }
        Err(e) => {
            error!(error = %e, records = count, "failed to store cost batch");
            state
                .health
                .aggregate_consumed
                .with_label_values(&["failed"])
                .inc_by(count as f64);
            (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}"))
        }
    }
}

/// Parses newline-delimited JSON records, ignoring blank lines.
pub fn decode_ndjson(data: &[u8]) -> Result<Vec<CostRecord>> {
    data.split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(idx, line)| {
            serde_json::from_slice(line).with_context(|| format!("decoding record on line {}", idx + 1))
        })
        .collect()
}
