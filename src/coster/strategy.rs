use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::allocation::{build_node_allocation, build_node_map, sum_resource_request};
use super::record::CostKind;
use super::table::PricingTable;
use crate::inventory::{Node, ResourceKind, Workload};

/// A priced observation produced by a strategy for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CostItem<'a> {
    pub kind: CostKind,
    pub strategy: &'static str,
    /// Micro-cents.
    pub value: i64,
    pub workload: Option<&'a Workload>,
    pub node: Option<&'a Node>,
}

/// Algorithms converting resource usage into cost items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingStrategy {
    /// Workload CPU request at the node's CPU rate.
    Cpu,
    /// Workload memory request at the node's memory rate.
    Memory,
    /// Workload GPU request at the node's GPU rate; GPU-less workloads are omitted.
    Gpu,
    /// Requests scaled by node capacity over node demand, summed across resources.
    Weighted,
    /// Full node capacity, independent of workloads.
    Node,
}

impl PricingStrategy {
    /// Every strategy, in evaluation order.
    pub const ALL: [Self; 5] = [
        Self::Gpu,
        Self::Cpu,
        Self::Memory,
        Self::Weighted,
        Self::Node,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "CPUPricingStrategy",
            Self::Memory => "MemoryPricingStrategy",
            Self::Gpu => "GPUPricingStrategy",
            Self::Weighted => "WeightedPricingStrategy",
            Self::Node => "NodePricingStrategy",
        }
    }

    pub fn kind(self) -> CostKind {
        match self {
            Self::Cpu => CostKind::Cpu,
            Self::Memory => CostKind::Memory,
            Self::Gpu => CostKind::Gpu,
            Self::Weighted => CostKind::Weighted,
            Self::Node => CostKind::Node,
        }
    }

    /// Prices `workloads` and `nodes` over `duration`.
    ///
    /// Items that cannot be priced (unknown node, no pricing entry) are
    /// skipped with a warning; they never fail the calculation.
    pub fn calculate<'a>(
        self,
        table: &PricingTable,
        duration: Duration,
        workloads: &'a [Workload],
        nodes: &'a [Node],
    ) -> Vec<CostItem<'a>> {
        let items = match self {
            Self::Cpu => self.request_cost(ResourceKind::Cpu, table, duration, workloads, nodes),
            Self::Memory => {
                self.request_cost(ResourceKind::Memory, table, duration, workloads, nodes)
            }
            Self::Gpu => self.request_cost(ResourceKind::Gpu, table, duration, workloads, nodes),
            Self::Weighted => self.weighted_cost(table, duration, workloads, nodes),
            Self::Node => self.node_cost(table, duration, nodes),
        };

        for item in &items {
            debug!(
                workload = item.workload.map(|w| w.metadata.name.as_str()).unwrap_or(""),
                node = item.node.map(|n| n.metadata.name.as_str()).unwrap_or(""),
                strategy = item.strategy,
                value = item.value,
                "generated cost item",
            );
        }

        items
    }

    fn request_cost<'a>(
        self,
        resource: ResourceKind,
        table: &PricingTable,
        duration: Duration,
        workloads: &'a [Workload],
        nodes: &'a [Node],
    ) -> Vec<CostItem<'a>> {
        let node_map = build_node_map(nodes);
        let mut items = Vec::with_capacity(workloads.len());

        for workload in workloads {
            let requested = sum_resource_request(workload, resource);
            if resource == ResourceKind::Gpu && requested == 0 {
                continue;
            }

            let Some(node) = node_map.get(workload.spec.node_name.as_str()).copied() else {
                warn!(node = %workload.spec.node_name, "could not find node for workload");
                continue;
            };

            let Ok(entry) = table.find_by_labels(&node.metadata.labels) else {
                warn!(node = %node.metadata.name, "could not find pricing entry for node");
                continue;
            };

            let quantity = requested as f64;
            let value = match resource {
                ResourceKind::Cpu => entry.cpu_cost(quantity, duration),
                ResourceKind::Memory => entry.memory_cost(quantity, duration),
                ResourceKind::Gpu => entry.gpu_cost(quantity, duration),
            };

            items.push(CostItem {
                kind: self.kind(),
                strategy: self.name(),
                value,
                workload: Some(workload),
                node: Some(node),
            });
        }

        items
    }

    fn weighted_cost<'a>(
        self,
        table: &PricingTable,
        duration: Duration,
        workloads: &'a [Workload],
        nodes: &'a [Node],
    ) -> Vec<CostItem<'a>> {
        let allocations = build_node_allocation(workloads, nodes);
        let mut items = Vec::with_capacity(workloads.len());

        for workload in workloads {
            let Some(alloc) = allocations.get(workload.spec.node_name.as_str()) else {
                warn!(node = %workload.spec.node_name, "could not find node allocation for workload");
                continue;
            };

            let Ok(entry) = table.find_by_labels(&alloc.node.metadata.labels) else {
                warn!(node = %alloc.node.metadata.name, "could not find pricing entry for node");
                continue;
            };

            let cpu = sum_resource_request(workload, ResourceKind::Cpu) as f64;
            let memory = sum_resource_request(workload, ResourceKind::Memory) as f64;
            let gpu = sum_resource_request(workload, ResourceKind::Gpu) as f64;

            let cpu_cost = entry.cpu_cost(cpu * alloc.scale_factor(ResourceKind::Cpu), duration);
            let memory_cost =
                entry.memory_cost(memory * alloc.scale_factor(ResourceKind::Memory), duration);
            let gpu_cost = entry.gpu_cost(gpu * alloc.scale_factor(ResourceKind::Gpu), duration);

            items.push(CostItem {
                kind: self.kind(),
                strategy: self.name(),
                value: cpu_cost.saturating_add(memory_cost).saturating_add(gpu_cost),
                workload: Some(workload),
                node: Some(alloc.node),
            });
        }

        items
    }

    fn node_cost<'a>(
        self,
        table: &PricingTable,
        duration: Duration,
        nodes: &'a [Node],
    ) -> Vec<CostItem<'a>> {
        let mut items = Vec::with_capacity(nodes.len());

        for node in nodes {
            let Ok(entry) = table.find_by_labels(&node.metadata.labels) else {
                warn!(node = %node.metadata.name, "could not find pricing entry for node");
                continue;
            };

            let cpu = match node.capacity(ResourceKind::Cpu) {
                Ok(v) => v,
                Err(e) => {
                    warn!(node = %node.metadata.name, error = %e, "could not read node cpu capacity, skipping");
                    continue;
                }
            };
            let memory = match node.capacity(ResourceKind::Memory) {
                Ok(v) => v,
                Err(e) => {
                    warn!(node = %node.metadata.name, error = %e, "could not read node memory capacity, skipping");
                    continue;
                }
            };
            // GPU capacity is optional; an unreadable value prices no GPUs.
            let gpu = node.capacity(ResourceKind::Gpu).unwrap_or(0);

            let value = entry
                .memory_cost(memory as f64, duration)
                .saturating_add(entry.cpu_cost(cpu as f64, duration))
                .saturating_add(entry.gpu_cost(gpu as f64, duration));

            items.push(CostItem {
                kind: self.kind(),
                strategy: self.name(),
                value,
                workload: None,
                node: Some(node),
            });
        }

        items
    }
}

impl fmt::Display for PricingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::super::allocation::fixtures::{node, workload, NODE_NAME};
    use super::super::table::{Labels, PricingEntry};
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn table() -> PricingTable {
        PricingTable::new(vec![PricingEntry {
            labels: Labels::from([("test".to_string(), "strategy".to_string())]),
            hourly_milli_cpu_cost_micro_cents: 1000.0,
            hourly_memory_byte_cost_micro_cents: 1.0,
            hourly_gpu_cost_micro_cents: 7_000_000.0,
        }])
    }

    fn pod_a() -> Workload {
        workload("a", NODE_NAME, &[("cpu", "500m"), ("memory", "32Mi")])
    }

    fn pod_b() -> Workload {
        workload("b", NODE_NAME, &[("cpu", "250m"), ("memory", "32Mi")])
    }

    fn pod_no_resources() -> Workload {
        workload("empty", NODE_NAME, &[])
    }

    fn pod_gpu(count: &str) -> Workload {
        workload("gpu", NODE_NAME, &[("nvidia.com/gpu", count)])
    }

    fn standard_node() -> Node {
        node(NODE_NAME, &[("cpu", "1"), ("memory", "1Gi")])
    }

    fn gpu_node(count: &str) -> Node {
        node(NODE_NAME, &[("cpu", "1"), ("nvidia.com/gpu", count)])
    }

    fn values(items: &[CostItem<'_>]) -> Vec<i64> {
        items.iter().map(|i| i.value).collect()
    }

    #[test]
    fn test_cpu_strategy() {
        let pods = vec![pod_a(), pod_b()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Cpu.calculate(&table(), HOUR, &pods, &nodes);

        assert_eq!(values(&items), vec![500_000, 250_000]);
        assert!(items.iter().all(|i| i.kind == CostKind::Cpu));
        assert!(items.iter().all(|i| i.strategy == "CPUPricingStrategy"));
        assert_eq!(items[0].workload, Some(&pods[0]));
        assert_eq!(items[0].node, Some(&nodes[0]));
    }

    #[test]
    fn test_cpu_strategy_without_requests_is_zero() {
        let pods = vec![pod_no_resources()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Cpu.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![0]);
    }

    #[test]
    fn test_memory_strategy() {
        let pods = vec![pod_a()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Memory.calculate(&table(), HOUR, &pods, &nodes);

        assert_eq!(values(&items), vec![33_554_432]);
        assert_eq!(items[0].kind, CostKind::Memory);
        assert_eq!(items[0].strategy, "MemoryPricingStrategy");
    }

    #[test]
    fn test_memory_strategy_without_requests_is_zero() {
        let pods = vec![pod_no_resources()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Memory.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![0]);
    }

    #[test]
    fn test_weighted_strategy_scales_to_node_capacity() {
        let pods = vec![pod_a(), pod_b()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Weighted.calculate(&table(), HOUR, &pods, &nodes);

        // cpu: 750m used of 1000m, memory: 64Mi used of 1Gi.
        assert_eq!(values(&items), vec![537_537_578, 537_204_245]);
        assert!(items.iter().all(|i| i.kind == CostKind::Weighted));
    }

    #[test]
    fn test_weighted_strategy_accounts_for_whole_node() {
        let pods = vec![pod_a(), pod_b()];
        let nodes = vec![standard_node()];
        let weighted: i64 = PricingStrategy::Weighted
            .calculate(&table(), HOUR, &pods, &nodes)
            .iter()
            .map(|i| i.value)
            .sum();
        let node: i64 = PricingStrategy::Node
            .calculate(&table(), HOUR, &pods, &nodes)
            .iter()
            .map(|i| i.value)
            .sum();

        // Per-item truncation may lose at most one micro-cent per component.
        assert!((node - weighted).abs() <= 4, "node={node} weighted={weighted}");
    }

    #[test]
    fn test_weighted_strategy_without_requests_is_zero() {
        let pods = vec![pod_no_resources()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Weighted.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![0]);
    }

    #[test]
    fn test_node_strategy() {
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Node.calculate(&table(), HOUR, &[], &nodes);

        // 1Gi of memory at 1/byte-hour plus 1000 milli-CPU at 1000/milli-hour.
        assert_eq!(values(&items), vec![1_074_741_824]);
        assert_eq!(items[0].workload, None);
        assert_eq!(items[0].kind, CostKind::Node);
    }

    #[test]
    fn test_gpu_strategy_omits_workloads_without_gpu() {
        let pods = vec![pod_a()];
        let nodes = vec![standard_node()];
        let items = PricingStrategy::Gpu.calculate(&table(), HOUR, &pods, &nodes);
        assert!(items.is_empty());
    }

    #[test]
    fn test_gpu_strategy_single_gpu() {
        let pods = vec![pod_gpu("1")];
        let nodes = vec![gpu_node("1")];
        let items = PricingStrategy::Gpu.calculate(&table(), HOUR, &pods, &nodes);

        assert_eq!(values(&items), vec![7_000_000]);
        assert_eq!(items[0].kind, CostKind::Gpu);
        assert_eq!(items[0].strategy, "GPUPricingStrategy");
    }

    #[test]
    fn test_gpu_strategy_on_multi_gpu_node() {
        let pods = vec![pod_gpu("1")];
        let nodes = vec![gpu_node("2")];
        let items = PricingStrategy::Gpu.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![7_000_000]);
    }

    #[test]
    fn test_weighted_strategy_with_gpu_pod() {
        let pods = vec![pod_a(), pod_gpu("1")];
        let nodes = vec![gpu_node("1")];
        let items = PricingStrategy::Weighted.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![1_000_000, 7_000_000]);
    }

    #[test]
    fn test_weighted_strategy_with_multi_gpu_pod() {
        let pods = vec![pod_gpu("2")];
        let nodes = vec![gpu_node("2")];
        let items = PricingStrategy::Weighted.calculate(&table(), HOUR, &pods, &nodes);
        assert_eq!(values(&items), vec![14_000_000]);
    }

    #[test]
    fn test_node_strategy_with_gpus() {
        let one = [gpu_node("1")];
        let items = PricingStrategy::Node.calculate(&table(), HOUR, &[], &one);
        assert_eq!(values(&items), vec![1_000_000 + 7_000_000]);

        let two = [gpu_node("2")];
        let items = PricingStrategy::Node.calculate(&table(), HOUR, &[], &two);
        assert_eq!(values(&items), vec![1_000_000 + 14_000_000]);
    }

    #[test]
    fn test_node_strategy_skips_unreadable_capacity() {
        let nodes = vec![node(NODE_NAME, &[("cpu", "??"), ("memory", "1Gi")])];
        let items = PricingStrategy::Node.calculate(&table(), HOUR, &[], &nodes);
        assert!(items.is_empty());
    }

    #[test]
    fn test_missing_node_is_skipped() {
        let pods = vec![workload("lost", "gone", &[("cpu", "1")]), pod_a()];
        let nodes = vec![standard_node()];

        for strategy in [
            PricingStrategy::Cpu,
            PricingStrategy::Memory,
            PricingStrategy::Weighted,
        ] {
            let items = strategy.calculate(&table(), HOUR, &pods, &nodes);
            assert_eq!(items.len(), 1, "{strategy}");
            assert_eq!(items[0].workload, Some(&pods[1]));
        }
    }

    #[test]
    fn test_unpriced_node_is_skipped() {
        let pods = vec![pod_a()];
        let mut unpriced = standard_node();
        unpriced.metadata.labels.clear();
        let nodes = vec![unpriced];

        for strategy in PricingStrategy::ALL {
            assert!(
                strategy.calculate(&table(), HOUR, &pods, &nodes).is_empty(),
                "{strategy}"
            );
        }
    }

    #[test]
    fn test_strategy_names_from_config() {
        let parsed: Vec<PricingStrategy> =
            serde_yaml::from_str("[cpu, memory, gpu, weighted, node]").expect("strategies");
        assert_eq!(
            parsed,
            vec![
                PricingStrategy::Cpu,
                PricingStrategy::Memory,
                PricingStrategy::Gpu,
                PricingStrategy::Weighted,
                PricingStrategy::Node,
            ]
        );
    }
}
