//! Cost attribution engine.
//!
//! Each cycle lists the inventory, prices it with every configured strategy,
//! maps each cost item to its dimensions and hands the resulting records to
//! the exporters.

pub mod allocation;
pub mod exporter;
pub mod filter;
pub mod mapper;
pub mod record;
pub mod strategy;
pub mod table;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::inventory::{Inventory, Node, Workload};

use self::exporter::CostExporter;
use self::filter::WorkloadFilters;
use self::mapper::{source_view, Mapper};
use self::record::CostRecord;
use self::strategy::{CostItem, PricingStrategy};
use self::table::PricingTable;

/// Errors produced while pricing a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CostError {
    #[error("could not find an appropriate cost entry")]
    NoCostEntry,
    #[error("senseless interval since last calculation")]
    SenselessInterval,
}

/// Phase of the calculation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Calculating,
    Exporting,
}

/// Runs every strategy in order over one snapshot.
pub fn calculate<'a>(
    strategies: &[PricingStrategy],
    table: &PricingTable,
    duration: Duration,
    workloads: &'a [Workload],
    nodes: &'a [Node],
) -> Vec<CostItem<'a>> {
    strategies
        .iter()
        .flat_map(|s| s.calculate(table, duration, workloads, nodes))
        .collect()
}

/// Periodically prices the inventory and emits cost records.
pub struct Coster {
    interval: Duration,
    table: PricingTable,
    mapper: Mapper,
    strategies: Vec<PricingStrategy>,
    filters: WorkloadFilters,
    inventory: Arc<dyn Inventory>,
    exporters: Vec<Arc<CostExporter>>,
    health: Arc<HealthMetrics>,
    state: CycleState,
    last_run: Option<DateTime<Utc>>,
}

impl Coster {
    pub fn new(
        cfg: &Config,
        inventory: Arc<dyn Inventory>,
        exporters: Vec<Arc<CostExporter>>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            interval: cfg.interval,
            table: cfg.pricing.clone(),
            mapper: cfg.mapping.clone(),
            strategies: cfg.strategies.clone(),
            filters: cfg.inventory.filters(),
            inventory,
            exporters,
            health,
            state: CycleState::Idle,
            last_run: None,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    /// Runs one cycle stamped with the current time.
    pub async fn calculate_and_emit(&mut self) -> Result<usize> {
        self.calculate_and_emit_at(Utc::now()).await
    }

    /// Runs one cycle as if it were `now`, returning the number of records
    /// handed to the exporters.
    ///
    /// A failed cycle exports nothing.
    pub async fn calculate_and_emit_at(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let started = Instant::now();
        let result = self.cycle(now).await;
        self.state = CycleState::Idle;

        let status = if result.is_ok() { "succeeded" } else { "failed" };
        self.health.cycles.with_label_values(&[status]).inc();
        self.health
            .cycle_duration
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn cycle(&mut self, now: DateTime<Utc>) -> Result<usize> {
        self.state = CycleState::Calculating;
        tracing::debug!("cost calculation cycle triggered");

        let workloads = self
            .inventory
            .list_workloads()
            .context("listing workloads")?;
        let workloads = self.filters.apply(workloads);
        let nodes = self.inventory.list_nodes().context("listing nodes")?;

        let duration = self.elapsed(now)?;

        let records = {
            let items = calculate(&self.strategies, &self.table, duration, &workloads, &nodes);
            for item in &items {
                self.health
                    .cost_items
                    .with_label_values(&[item.strategy])
                    .inc();
            }
            self.to_records(&items, now)
        };

        self.state = CycleState::Exporting;
        for record in &records {
            for exporter in &self.exporters {
                exporter.export_cost(record.clone()).await;
            }
        }

        tracing::debug!(
            workloads = workloads.len(),
            nodes = nodes.len(),
            records = records.len(),
            "cost calculation cycle completed",
        );

        Ok(records.len())
    }

    /// Time covered by this cycle. The first cycle covers one configured
    /// interval; later cycles cover the time since the previous one.
    fn elapsed(&mut self, now: DateTime<Utc>) -> Result<Duration, CostError> {
        let Some(last) = self.last_run else {
            self.last_run = Some(now);
            return Ok(self.interval);
        };

        let elapsed = now
            .signed_duration_since(last)
            .to_std()
            .map_err(|_| CostError::SenselessInterval)?;
        if elapsed.is_zero() {
            return Err(CostError::SenselessInterval);
        }

        self.last_run = Some(now);

        let lag = elapsed.as_millis() as i64 - self.interval.as_millis() as i64;
        self.health.lag_milliseconds.set(lag as f64);

        Ok(elapsed)
    }

    fn to_records(&self, items: &[CostItem<'_>], now: DateTime<Utc>) -> Vec<CostRecord> {
        items
            .iter()
            .map(|item| CostRecord {
                kind: item.kind,
                strategy: item.strategy.to_string(),
                value: item.value,
                dimensions: self.mapper.map_data(&source_view(item)),
                end_time: now,
            })
            .collect()
    }

    /// Runs a cycle every interval until `cancel` fires. Failed cycles are
    /// logged and the loop continues.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the first cycle runs one
        // interval after start.
        ticker.tick().await;

        tracing::info!(interval = ?self.interval, "Starting cost calculation loop");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cost calculation loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.calculate_and_emit().await {
                        tracing::error!(error = %e, "Cost calculation cycle failed");
                    }
                }
            }
        }
    }
}
