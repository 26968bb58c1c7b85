pub mod aggregate;
pub mod group;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::coster::exporter::{build_exporters, CostExporter};
use crate::coster::Coster;
use crate::export::clickhouse::ClickHouseExporter;
use crate::export::health::HealthMetrics;
use crate::inventory::snapshot::{SnapshotInventory, SnapshotLister};
use crate::inventory::{Node, Workload};

use self::group::TaskGroup;

/// Agent wires configuration into running components for one mode.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Token that stops the running mode when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the collector until shutdown or until any component exits.
    ///
    /// Components: pod and node snapshot sync loops, the metrics server and
    /// the calculation loop. Exporters are stopped last so buffered records
    /// are flushed downstream.
    pub async fn run_collect(&self) -> Result<()> {
        self.cfg.validate_collect()?;

        let inv = &self.cfg.inventory;
        let pods = Arc::new(SnapshotLister::<Workload>::new(
            "pods",
            &inv.pods_path,
            inv.resync_interval,
            Some(Arc::clone(&self.health)),
        ));
        let nodes = Arc::new(SnapshotLister::<Node>::new(
            "nodes",
            &inv.nodes_path,
            inv.resync_interval,
            Some(Arc::clone(&self.health)),
        ));

        let exporters = self.start_exporters().await?;

        let inventory = Arc::new(SnapshotInventory {
            pods: Arc::clone(&pods),
            nodes: Arc::clone(&nodes),
        });
        let mut coster = Coster::new(
            &self.cfg,
            inventory,
            exporters.clone(),
            Arc::clone(&self.health),
        );

        info!(
            pricing_entries = self.cfg.pricing.entries.len(),
            strategies = ?self.cfg.strategies,
            dimensions = ?self.cfg.mapping.destinations(),
            exporters = ?exporters.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "collector configured",
        );

        let mut group = TaskGroup::new(self.cancel.clone());
        group.spawn("pods", pods.run(group.token()));
        group.spawn("nodes", nodes.run(group.token()));

        let health = Arc::clone(&self.health);
        let token = group.token();
        group.spawn("health", async move { health.serve(token).await });

        let token = group.token();
        group.spawn("coster", async move { coster.run(token).await });

        let result = group.wait().await;
        stop_exporters(&exporters).await;

        info!("collector stopped");

        result
    }

    /// Runs the ingestion server until shutdown, storing every accepted
    /// batch in ClickHouse.
    pub async fn run_aggregate(&self) -> Result<()> {
        self.cfg.validate_aggregate()?;

        let destinations = self
            .cfg
            .mapping
            .destinations()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut exporter = CostExporter::ClickHouse(ClickHouseExporter::new(
            self.cfg.exporters.clickhouse.clone(),
            destinations,
            Some(Arc::clone(&self.health)),
        ));
        exporter
            .start(self.cancel.child_token())
            .await
            .context("starting ClickHouse exporter")?;
        let exporter = Arc::new(exporter);

        let app = aggregate::router(
            Arc::clone(&exporter),
            Arc::clone(&self.health),
            self.cfg.aggregate.max_body_bytes,
        );

        let mut group = TaskGroup::new(self.cancel.clone());
        let health = Arc::clone(&self.health);
        let token = group.token();
        group.spawn("server", async move { health.serve_with(app, token).await });

        let result = group.wait().await;
        stop_exporters(std::slice::from_ref(&exporter)).await;

        info!("aggregator stopped");

        result
    }

    async fn start_exporters(&self) -> Result<Vec<Arc<CostExporter>>> {
        let destinations = self.cfg.mapping.destinations();
        let exporters = build_exporters(&self.cfg.exporters, &destinations, &self.health)
            .context("building exporters")?;

        let mut started = Vec::with_capacity(exporters.len());
        for mut exporter in exporters {
            if let Err(e) = exporter.start(self.cancel.child_token()).await {
                stop_exporters(&started).await;
                return Err(e).with_context(|| format!("starting {} exporter", exporter.name()));
            }
            info!(exporter = exporter.name(), "exporter started");
            started.push(Arc::new(exporter));
        }

        Ok(started)
    }
}

async fn stop_exporters(exporters: &[Arc<CostExporter>]) {
    for exporter in exporters {
        if let Err(e) = exporter.stop().await {
            error!(exporter = exporter.name(), error = %e, "error stopping exporter");
        }
    }
}
