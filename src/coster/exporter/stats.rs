use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{CounterVec, Opts};

use crate::coster::record::CostRecord;
use crate::export::health::{HealthMetrics, NAMESPACE};

const EXPORTER_NAME: &str = "stats";

/// Publishes every record as a Prometheus counter labelled by kind, strategy
/// and each mapping destination.
pub struct StatsExporter {
    cost: CounterVec,
    destinations: Vec<String>,
    health: Arc<HealthMetrics>,
}

impl StatsExporter {
    /// Registers `cost_microcents_total` with one label per destination.
    pub fn new(destinations: &[&str], health: Arc<HealthMetrics>) -> Result<Self> {
        let mut labels = vec!["kind", "strategy"];
        labels.extend_from_slice(destinations);

        let cost = CounterVec::new(
            Opts::new("cost_microcents_total", "Attributed cost in micro-cents.")
                .namespace(NAMESPACE),
            &labels,
        )
        .context("creating cost counter")?;

        health
            .registry()
            .register(Box::new(cost.clone()))
            .context("registering cost counter")?;

        Ok(Self {
            cost,
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            health,
        })
    }

    pub fn name(&self) -> &str {
        EXPORTER_NAME
    }

    pub fn export_cost(&self, record: &CostRecord) {
        if record.value < 0 {
            tracing::warn!(
                kind = %record.kind,
                strategy = %record.strategy,
                value = record.value,
                "Negative cost cannot be added to counter",
            );
            self.health
                .export_errors
                .with_label_values(&[EXPORTER_NAME])
                .inc();
            return;
        }

        let mut values = Vec::with_capacity(2 + self.destinations.len());
        values.push(record.kind.as_str());
        values.push(record.strategy.as_str());
        for dest in &self.destinations {
            values.push(record.dimensions.get(dest).map(String::as_str).unwrap_or(""));
        }

        match self.cost.get_metric_with_label_values(&values) {
            Ok(counter) => counter.inc_by(record.value as f64),
            Err(e) => {
                tracing::warn!(error = %e, "Could not resolve cost counter");
                self.health
                    .export_errors
                    .with_label_values(&[EXPORTER_NAME])
                    .inc();
            }
        }
    }
}

/// Sums `cost_microcents_total` over every series carrying all of `labels`.
#[cfg(test)]
pub(crate) fn cost_total(health: &HealthMetrics, labels: &[(&str, &str)]) -> Option<f64> {
    let families = health.registry().gather();
    let family = families
        .iter()
        .find(|f| f.get_name() == "costmeter_cost_microcents_total")?;

    let matching: Vec<f64> = family
        .get_metric()
        .iter()
        .filter(|m| {
            labels.iter().all(|(name, value)| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == *name && l.get_value() == *value)
            })
        })
        .map(|m| m.get_counter().get_value())
        .collect();

    if matching.is_empty() {
        None
    } else {
        Some(matching.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::coster::record::CostKind;

    fn record(kind: CostKind, value: i64, dims: &[(&str, &str)]) -> CostRecord {
        CostRecord {
            kind,
            strategy: "WeightedPricingStrategy".to_string(),
            value,
            dimensions: dims
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            end_time: Utc::now(),
        }
    }

    #[test]
    fn test_counts_cost_per_dimension() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let stats = StatsExporter::new(&["service", "team"], Arc::clone(&health)).expect("stats");

        stats.export_cost(&record(CostKind::Weighted, 10, &[("service", "a"), ("team", "x")]));
        stats.export_cost(&record(CostKind::Weighted, 5, &[("service", "a"), ("team", "x")]));
        stats.export_cost(&record(CostKind::Weighted, 1, &[("service", "b"), ("team", "x")]));

        assert_eq!(cost_total(&health, &[("service", "a")]), Some(15.0));
        assert_eq!(cost_total(&health, &[("team", "x")]), Some(16.0));
        assert_eq!(
            cost_total(&health, &[("kind", "weighted"), ("strategy", "WeightedPricingStrategy")]),
            Some(16.0)
        );
    }

    #[test]
    fn test_missing_dimension_uses_empty_label() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let stats = StatsExporter::new(&["service"], Arc::clone(&health)).expect("stats");

        stats.export_cost(&record(CostKind::Node, 3, &[("unmapped", "z")]));

        assert_eq!(cost_total(&health, &[("service", "")]), Some(3.0));
    }

    #[test]
    fn test_negative_cost_counts_as_error() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let stats = StatsExporter::new(&[], Arc::clone(&health)).expect("stats");

        stats.export_cost(&record(CostKind::Cpu, -1, &[]));

        assert_eq!(cost_total(&health, &[]), None);
        assert_eq!(
            health.export_errors.with_label_values(&["stats"]).get(),
            1.0
        );
    }

    #[test]
    fn test_second_registration_fails() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let _first = StatsExporter::new(&[], Arc::clone(&health)).expect("stats");
        assert!(StatsExporter::new(&[], health).is_err());
    }
}
