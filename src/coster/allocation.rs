use std::collections::HashMap;

use tracing::warn;

use crate::inventory::{Node, ResourceKind, Workload};

/// Sums the request for `kind` across every container of `workload`.
///
/// CPU is returned in milli-units, memory in bytes and GPUs in whole
/// devices. Containers without a request, or with an unparseable one,
/// contribute zero.
pub fn sum_resource_request(workload: &Workload, kind: ResourceKind) -> i64 {
    let milli: i64 = workload
        .spec
        .containers
        .iter()
        .filter_map(|c| c.resources.requests.get(kind.resource_name()))
        .filter_map(|q| match q.milli_value() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    workload = %workload.key(),
                    resource = kind.resource_name(),
                    error = %e,
                    "ignoring unparseable resource request",
                );
                None
            }
        })
        .fold(0i64, |acc, v| acc.saturating_add(v));

    match kind {
        ResourceKind::Cpu => milli,
        ResourceKind::Memory | ResourceKind::Gpu => milli / 1000,
    }
}

/// Requested and advertised resources of one node for a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu: i64,
    pub memory: i64,
    pub gpu: i64,
}

impl Resources {
    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Gpu => self.gpu,
        }
    }

    fn get_mut(&mut self, kind: ResourceKind) -> &mut i64 {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Memory => &mut self.memory,
            ResourceKind::Gpu => &mut self.gpu,
        }
    }
}

const KINDS: [ResourceKind; 3] = [ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::Gpu];

/// Per-node allocation: summed workload requests against capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAllocation<'a> {
    pub node: &'a Node,
    pub used: Resources,
    pub available: Resources,
}

impl NodeAllocation<'_> {
    /// Ratio of capacity to summed requests for `kind`.
    ///
    /// Returns 0 for a resource the node neither advertises nor has
    /// requested, where the ratio is undefined.
    pub fn scale_factor(&self, kind: ResourceKind) -> f64 {
        let used = self.used.get(kind);
        if used == 0 {
            return 0.0;
        }
        self.available.get(kind) as f64 / used as f64
    }
}

/// Builds the allocation of every node from the workloads scheduled on it.
///
/// A resource nobody requested is treated as fully used (usage is set to
/// capacity) so proportional strategies never divide by zero. Workloads
/// referencing unknown nodes are skipped.
pub fn build_node_allocation<'a>(
    workloads: &[Workload],
    nodes: &'a [Node],
) -> HashMap<&'a str, NodeAllocation<'a>> {
    let mut allocations: HashMap<&'a str, NodeAllocation<'a>> = HashMap::with_capacity(nodes.len());

    for node in nodes {
        let mut available = Resources::default();
        for kind in KINDS {
            *available.get_mut(kind) = match node.capacity(kind) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        node = %node.metadata.name,
                        resource = kind.resource_name(),
                        error = %e,
                        "unreadable node capacity, assuming zero",
                    );
                    0
                }
            };
        }

        allocations.insert(
            node.metadata.name.as_str(),
            NodeAllocation {
                node,
                used: Resources::default(),
                available,
            },
        );
    }

    for workload in workloads {
        let Some(alloc) = allocations.get_mut(workload.spec.node_name.as_str()) else {
            warn!(
                workload = %workload.key(),
                node = %workload.spec.node_name,
                "workload references unknown node, skipping",
            );
            continue;
        };

        for kind in KINDS {
            let used = alloc.used.get_mut(kind);
            *used = used.saturating_add(sum_resource_request(workload, kind));
        }
    }

    for alloc in allocations.values_mut() {
        for kind in KINDS {
            if alloc.used.get(kind) == 0 {
                *alloc.used.get_mut(kind) = alloc.available.get(kind);
            }
        }
    }

    allocations
}

/// Indexes nodes by name.
pub fn build_node_map(nodes: &[Node]) -> HashMap<&str, &Node> {
    nodes.iter().map(|n| (n.metadata.name.as_str(), n)).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::inventory::{
        Container, Node, NodeStatus, ObjectMeta, Quantity, ResourceRequirements, Workload,
        WorkloadSpec, WorkloadStatus, PHASE_RUNNING,
    };

    pub const NODE_NAME: &str = "strategy-test-node";

    pub fn workload(name: &str, node: &str, requests: &[(&str, &str)]) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: WorkloadSpec {
                node_name: node.to_string(),
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: ResourceRequirements {
                        requests: requests
                            .iter()
                            .map(|(k, v)| (k.to_string(), Quantity::new(*v)))
                            .collect(),
                    },
                }],
            },
            status: WorkloadStatus {
                phase: PHASE_RUNNING.to_string(),
            },
        }
    }

    pub fn node(name: &str, capacity: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: name.to_string(),
                labels: [("test".to_string(), "strategy".to_string())].into(),
                ..Default::default()
            },
            status: NodeStatus {
                capacity: capacity
                    .iter()
                    .map(|(k, v)| (k.to_string(), Quantity::new(*v)))
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{node, workload, NODE_NAME};
    use super::*;
    use crate::inventory::{Container, Quantity, ResourceRequirements};

    #[test]
    fn test_sum_resource_request_across_containers() {
        let mut w = workload("a", NODE_NAME, &[("cpu", "500m"), ("memory", "32Mi")]);
        w.spec.containers.push(Container {
            name: "sidecar".to_string(),
            resources: ResourceRequirements {
                requests: [("cpu".to_string(), Quantity::new("250m"))].into(),
            },
        });
        w.spec.containers.push(Container::default());

        assert_eq!(sum_resource_request(&w, ResourceKind::Cpu), 750);
        assert_eq!(sum_resource_request(&w, ResourceKind::Memory), 33_554_432);
        assert_eq!(sum_resource_request(&w, ResourceKind::Gpu), 0);
    }

    #[test]
    fn test_sum_resource_request_gpu_units() {
        let w = workload("g", NODE_NAME, &[("nvidia.com/gpu", "2")]);
        assert_eq!(sum_resource_request(&w, ResourceKind::Gpu), 2);
    }

    #[test]
    fn test_unparseable_request_contributes_zero() {
        let w = workload("bad", NODE_NAME, &[("cpu", "lots")]);
        assert_eq!(sum_resource_request(&w, ResourceKind::Cpu), 0);
    }

    #[test]
    fn test_build_node_allocation_sums_usage() {
        let nodes = vec![node(NODE_NAME, &[("cpu", "1"), ("memory", "1Gi")])];
        let workloads = vec![
            workload("a", NODE_NAME, &[("cpu", "500m"), ("memory", "32Mi")]),
            workload("b", NODE_NAME, &[("cpu", "250m"), ("memory", "32Mi")]),
        ];

        let allocs = build_node_allocation(&workloads, &nodes);
        let alloc = allocs.get(NODE_NAME).expect("node allocation");
        assert_eq!(alloc.used.cpu, 750);
        assert_eq!(alloc.used.memory, 67_108_864);
        assert_eq!(alloc.available.cpu, 1000);
        assert_eq!(alloc.available.memory, 1_073_741_824);
    }

    #[test]
    fn test_zero_usage_defaults_to_capacity_per_resource() {
        let nodes = vec![node(
            NODE_NAME,
            &[("cpu", "1"), ("memory", "1Gi"), ("nvidia.com/gpu", "1")],
        )];
        // Requests memory only; CPU and GPU usage fall back independently.
        let workloads = vec![workload("a", NODE_NAME, &[("memory", "32Mi")])];

        let allocs = build_node_allocation(&workloads, &nodes);
        let alloc = allocs.get(NODE_NAME).expect("node allocation");
        assert_eq!(alloc.used.cpu, 1000);
        assert_eq!(alloc.used.memory, 33_554_432);
        assert_eq!(alloc.used.gpu, 1);
    }

    #[test]
    fn test_node_without_workloads_is_fully_used() {
        let nodes = vec![node("idle", &[("cpu", "2"), ("memory", "1Gi")])];
        let allocs = build_node_allocation(&[], &nodes);
        let alloc = allocs.get("idle").expect("node allocation");
        assert_eq!(alloc.used, alloc.available);
        assert_eq!(alloc.scale_factor(ResourceKind::Cpu), 1.0);
    }

    #[test]
    fn test_workload_on_unknown_node_is_skipped() {
        let nodes = vec![node(NODE_NAME, &[("cpu", "1")])];
        let workloads = vec![
            workload("lost", "gone", &[("cpu", "500m")]),
            workload("a", NODE_NAME, &[("cpu", "250m")]),
        ];

        let allocs = build_node_allocation(&workloads, &nodes);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs.get(NODE_NAME).expect("node").used.cpu, 250);
    }

    #[test]
    fn test_scale_factor() {
        let nodes = vec![node(NODE_NAME, &[("cpu", "1"), ("memory", "1Gi")])];
        let workloads = vec![workload("a", NODE_NAME, &[("cpu", "250m"), ("memory", "512Mi")])];

        let allocs = build_node_allocation(&workloads, &nodes);
        let alloc = allocs.get(NODE_NAME).expect("node allocation");
        assert_eq!(alloc.scale_factor(ResourceKind::Cpu), 4.0);
        assert_eq!(alloc.scale_factor(ResourceKind::Memory), 2.0);
        // No GPU advertised or requested.
        assert_eq!(alloc.scale_factor(ResourceKind::Gpu), 0.0);
    }

    #[test]
    fn test_unreadable_capacity_is_zero() {
        let nodes = vec![node(NODE_NAME, &[("cpu", "many"), ("memory", "1Gi")])];
        let allocs = build_node_allocation(&[], &nodes);
        assert_eq!(allocs.get(NODE_NAME).expect("node").available.cpu, 0);
    }
}
