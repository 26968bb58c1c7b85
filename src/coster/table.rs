use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CostError;

/// Label set attached to nodes and pricing entries.
pub type Labels = BTreeMap<String, String>;

const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;

/// Reports whether every pair in `selector` is present in `candidate`.
///
/// An empty selector matches any candidate, including an empty one.
pub fn matches(selector: &Labels, candidate: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| candidate.get(k).is_some_and(|cv| cv == v))
}

/// Hourly rates for one class of node, in micro-cents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    #[serde(default)]
    pub labels: Labels,
    #[serde(rename = "hourlyMilliCPUCostMicroCents", default)]
    pub hourly_milli_cpu_cost_micro_cents: f64,
    #[serde(rename = "hourlyMemoryByteCostMicroCents", default)]
    pub hourly_memory_byte_cost_micro_cents: f64,
    #[serde(rename = "hourlyGPUCostMicroCents", default)]
    pub hourly_gpu_cost_micro_cents: f64,
}

impl PricingEntry {
    pub fn matches(&self, labels: &Labels) -> bool {
        matches(&self.labels, labels)
    }

    /// Cost of `milli_cpu` milli-CPU held for `duration`.
    pub fn cpu_cost(&self, milli_cpu: f64, duration: Duration) -> i64 {
        cost(milli_cpu, duration, self.hourly_milli_cpu_cost_micro_cents)
    }

    /// Cost of `bytes` of memory held for `duration`.
    pub fn memory_cost(&self, bytes: f64, duration: Duration) -> i64 {
        cost(bytes, duration, self.hourly_memory_byte_cost_micro_cents)
    }

    /// Cost of `gpus` devices held for `duration`.
    pub fn gpu_cost(&self, gpus: f64, duration: Duration) -> i64 {
        cost(gpus, duration, self.hourly_gpu_cost_micro_cents)
    }
}

// Truncates toward zero; no compensating rounding across intervals.
fn cost(quantity: f64, duration: Duration, hourly_rate: f64) -> i64 {
    let fraction = duration.as_nanos() as f64 / NANOS_PER_HOUR;
    (quantity * fraction * hourly_rate) as i64
}

/// Ordered pricing entries. The first matching entry wins, even when a
/// later entry is more specific.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub entries: Vec<PricingEntry>,
}

impl PricingTable {
    pub fn new(entries: Vec<PricingEntry>) -> Self {
        Self { entries }
    }

    pub fn find_by_labels(&self, labels: &Labels) -> Result<&PricingEntry, CostError> {
        self.entries
            .iter()
            .find(|e| e.matches(labels))
            .ok_or(CostError::NoCostEntry)
    }

    /// Number of entries with an empty selector.
    pub fn fallback_count(&self) -> usize {
        self.entries.iter().filter(|e| e.labels.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn entry(pairs: &[(&str, &str)], cpu_rate: f64) -> PricingEntry {
        PricingEntry {
            labels: labels(pairs),
            hourly_milli_cpu_cost_micro_cents: cpu_rate,
            ..Default::default()
        }
    }

    const INSTANCE: (&str, &str) = ("beta.kubernetes.io/instance-type", "n1-standard-16");
    const REGION: (&str, &str) = ("failure-domain.beta.kubernetes.io/region", "us-central1");
    const ZONE: (&str, &str) = ("failure-domain.beta.kubernetes.io/zone", "us-central1-b");

    #[test]
    fn test_matches_subset() {
        let selector = labels(&[INSTANCE, REGION]);
        assert!(matches(
            &selector,
            &labels(&[INSTANCE, REGION, ("another-ignored-label", "x")])
        ));
        assert!(!matches(&selector, &labels(&[INSTANCE])));
        assert!(!matches(
            &selector,
            &labels(&[INSTANCE, ("failure-domain.beta.kubernetes.io/region", "europe-west1")])
        ));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let empty = Labels::new();
        assert!(matches(&empty, &empty));
        assert!(matches(&empty, &labels(&[ZONE])));
    }

    #[test]
    fn test_find_by_labels_empty_table() {
        let table = PricingTable::default();
        assert_eq!(
            table.find_by_labels(&labels(&[ZONE])),
            Err(CostError::NoCostEntry)
        );
        assert_eq!(table.find_by_labels(&Labels::new()), Err(CostError::NoCostEntry));
    }

    #[test]
    fn test_find_by_labels_no_match() {
        let table = PricingTable::new(vec![entry(&[INSTANCE], 1.0)]);
        assert_eq!(
            table.find_by_labels(&labels(&[REGION])),
            Err(CostError::NoCostEntry)
        );
    }

    #[test]
    fn test_find_by_labels_fallback() {
        let table = PricingTable::new(vec![entry(&[INSTANCE], 1.0), entry(&[], 2.0)]);
        let found = table.find_by_labels(&labels(&[ZONE])).expect("fallback entry");
        assert_eq!(found.hourly_milli_cpu_cost_micro_cents, 2.0);
    }

    #[test]
    fn test_find_by_labels_first_match_wins_over_more_specific() {
        let table = PricingTable::new(vec![
            entry(&[INSTANCE, REGION], 1.0),
            entry(&[INSTANCE, REGION, ZONE], 2.0),
        ]);
        let found = table
            .find_by_labels(&labels(&[INSTANCE, REGION, ZONE]))
            .expect("matching entry");
        assert_eq!(found.hourly_milli_cpu_cost_micro_cents, 1.0);
    }

    #[test]
    fn test_cpu_cost() {
        let e = PricingEntry {
            hourly_milli_cpu_cost_micro_cents: 15000.0,
            hourly_memory_byte_cost_micro_cents: 1.0,
            ..Default::default()
        };
        assert_eq!(e.cpu_cost(500.0, Duration::from_secs(3600)), 7_500_000);
        assert_eq!(e.cpu_cost(500.0, Duration::from_secs(300)), 625_000);
        assert_eq!(e.cpu_cost(1000.0, Duration::from_secs(3600)), 15_000_000);
    }

    #[test]
    fn test_memory_cost_truncates() {
        let e = PricingEntry {
            hourly_memory_byte_cost_micro_cents: 1.0,
            ..Default::default()
        };
        assert_eq!(e.memory_cost(1_048_576.0, Duration::from_secs(3600)), 1_048_576);
        // 1048576 / 60 = 17476.27
        assert_eq!(e.memory_cost(1_048_576.0, Duration::from_secs(60)), 17_476);
    }

    #[test]
    fn test_gpu_cost() {
        let e = PricingEntry {
            hourly_gpu_cost_micro_cents: 7_000_000.0,
            ..Default::default()
        };
        assert_eq!(e.gpu_cost(1.0, Duration::from_secs(3600)), 7_000_000);
        assert_eq!(e.gpu_cost(0.0, Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_deserialize_entry_field_names() {
        let raw = r#"{
            "labels": {"pool": "gpu"},
            "hourlyMilliCPUCostMicroCents": 1000,
            "hourlyMemoryByteCostMicroCents": 0.5,
            "hourlyGPUCostMicroCents": 7000000
        }"#;
        let e: PricingEntry = serde_json::from_str(raw).expect("entry json");
        assert_eq!(e.hourly_milli_cpu_cost_micro_cents, 1000.0);
        assert_eq!(e.hourly_memory_byte_cost_micro_cents, 0.5);
        assert_eq!(e.hourly_gpu_cost_micro_cents, 7_000_000.0);
        assert_eq!(e.labels.get("pool").map(String::as_str), Some("gpu"));
    }

    #[test]
    fn test_fallback_count() {
        let table = PricingTable::new(vec![entry(&[], 1.0), entry(&[ZONE], 1.0), entry(&[], 1.0)]);
        assert_eq!(table.fallback_count(), 2);
    }
}
