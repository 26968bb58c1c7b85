pub mod buffering;
pub mod stats;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::ExportersConfig;
use crate::export::clickhouse::ClickHouseExporter;
use crate::export::health::HealthMetrics;
use crate::export::http::HttpExporter;

use self::buffering::BufferingExporter;
use self::stats::StatsExporter;
use super::record::CostRecord;

/// Lifecycle future of an exporter.
///
/// Boxed because a buffering exporter starts and stops the exporter it owns.
pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Destination for cost records.
///
/// Closed set of exporters dispatched by enum, mirroring the durable
/// exporters it wraps. A buffering exporter owns the exporter it flushes to.
pub enum CostExporter {
    Stats(StatsExporter),
    Buffering(BufferingExporter),
    Http(HttpExporter),
    ClickHouse(ClickHouseExporter),
}

impl CostExporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Stats(e) => e.name(),
            Self::Buffering(e) => e.name(),
            Self::Http(e) => e.name(),
            Self::ClickHouse(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub fn start(&mut self, ctx: CancellationToken) -> LifecycleFuture<'_> {
        match self {
            Self::Stats(_) => Box::pin(async { Ok(()) }),
            Self::Buffering(e) => Box::pin(e.start(ctx)),
            Self::Http(e) => Box::pin(e.start(ctx)),
            Self::ClickHouse(e) => Box::pin(e.start(ctx)),
        }
    }

    /// Hand one record to the exporter. Failures are counted, never returned.
    pub async fn export_cost(&self, record: CostRecord) {
        match self {
            Self::Stats(e) => e.export_cost(&record),
            Self::Buffering(e) => e.export_cost(record),
            Self::Http(e) => e.export_cost(record).await,
            Self::ClickHouse(e) => e.export_cost(record).await,
        }
    }

    /// Hand over a batch whose delivery the caller acknowledges upstream.
    ///
    /// ClickHouse inserts the batch before returning and reports failure;
    /// other exporters accept each record as [`Self::export_cost`] does.
    pub async fn export_batch(&self, records: Vec<CostRecord>) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.insert_batch(&records).await,
            _ => {
                for record in records {
                    self.export_cost(record).await;
                }
                Ok(())
            }
        }
    }

    /// Shut down the exporter, delivering anything it still holds.
    pub fn stop(&self) -> LifecycleFuture<'_> {
        match self {
            Self::Stats(_) => Box::pin(async { Ok(()) }),
            Self::Buffering(e) => Box::pin(e.stop()),
            Self::Http(e) => Box::pin(e.stop()),
            Self::ClickHouse(e) => Box::pin(e.stop()),
        }
    }
}

/// Builds the configured exporter set.
///
/// The stats exporter sees every record as it is produced. Durable exporters
/// sit behind their own buffering exporter so they receive merged records
/// once per flush interval.
pub fn build_exporters(
    cfg: &ExportersConfig,
    destinations: &[&str],
    health: &Arc<HealthMetrics>,
) -> Result<Vec<CostExporter>> {
    let mut exporters = Vec::new();

    if cfg.stats.enabled {
        exporters.push(CostExporter::Stats(StatsExporter::new(
            destinations,
            Arc::clone(health),
        )?));
    }

    if cfg.http.enabled {
        let http = HttpExporter::new(cfg.http.clone(), Some(Arc::clone(health)));
        exporters.push(CostExporter::Buffering(BufferingExporter::new(
            CostExporter::Http(http),
            cfg.buffer.flush_interval,
            Some(Arc::clone(health)),
        )));
    }

    if cfg.clickhouse.enabled {
        let clickhouse = ClickHouseExporter::new(
            cfg.clickhouse.clone(),
            destinations.iter().map(|d| d.to_string()).collect(),
            Some(Arc::clone(health)),
        );
        exporters.push(CostExporter::Buffering(BufferingExporter::new(
            CostExporter::ClickHouse(clickhouse),
            cfg.buffer.flush_interval,
            Some(Arc::clone(health)),
        )));
    }

    Ok(exporters)
}
