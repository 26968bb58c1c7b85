pub mod quantity;
pub mod snapshot;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use quantity::{Quantity, QuantityError};

/// Extended resource name used for GPU requests and capacity.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Workload phase that marks a running pod.
pub const PHASE_RUNNING: &str = "Running";

/// Resources the pricing model knows how to cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
}

impl ResourceKind {
    /// Name of the resource in request and capacity lists.
    pub fn resource_name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Gpu => GPU_RESOURCE_NAME,
        }
    }

    /// Converts a quantity to the unit the pricing table rates:
    /// milli-CPU, bytes, or whole GPUs.
    pub fn units_of(self, quantity: &Quantity) -> Result<i64, QuantityError> {
        match self {
            Self::Cpu => quantity.milli_value(),
            Self::Memory | Self::Gpu => quantity.value(),
        }
    }
}

/// Object metadata shared by workloads and nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A schedulable unit (a pod) with per-container resource requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub phase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

/// A cluster member advertising resource capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: BTreeMap<String, Quantity>,
}

impl Workload {
    /// Cache key in `namespace/name` form.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == PHASE_RUNNING
    }
}

impl Node {
    pub fn key(&self) -> String {
        self.metadata.name.clone()
    }

    /// Advertised capacity for `kind` in pricing units.
    ///
    /// `Ok(0)` when the node does not advertise the resource at all.
    pub fn capacity(&self, kind: ResourceKind) -> Result<i64, QuantityError> {
        match self.status.capacity.get(kind.resource_name()) {
            Some(q) => kind.units_of(q),
            None => Ok(0),
        }
    }
}

/// Source of the workload and node snapshot evaluated each cycle.
pub trait Inventory: Send + Sync {
    fn list_workloads(&self) -> Result<Vec<Workload>>;
    fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// Fixed inventory, useful for one-shot runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    pub workloads: Vec<Workload>,
    pub nodes: Vec<Node>,
}

impl StaticInventory {
    pub fn new(workloads: Vec<Workload>, nodes: Vec<Node>) -> Self {
        Self { workloads, nodes }
    }
}

impl Inventory for StaticInventory {
    fn list_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self.workloads.clone())
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_kubectl_pod() {
        let raw = r#"{
            "metadata": {
                "name": "api-7d9f",
                "namespace": "prod",
                "labels": {"app": "api"},
                "annotations": {"service": "checkout"}
            },
            "spec": {
                "nodeName": "node-a",
                "containers": [
                    {"name": "api", "resources": {"requests": {"cpu": "500m", "memory": "32Mi"}}},
                    {"name": "sidecar", "resources": {}}
                ]
            },
            "status": {"phase": "Running"}
        }"#;

        let pod: Workload = serde_json::from_str(raw).expect("pod json");
        assert_eq!(pod.key(), "prod/api-7d9f");
        assert_eq!(pod.spec.node_name, "node-a");
        assert_eq!(pod.spec.containers.len(), 2);
        assert!(pod.is_running());
        assert_eq!(
            pod.metadata.annotations.get("service").map(String::as_str),
            Some("checkout")
        );
    }

    #[test]
    fn test_node_capacity_units() {
        let raw = r#"{
            "metadata": {"name": "node-a", "labels": {"pool": "gpu"}},
            "status": {"capacity": {"cpu": "4", "memory": "1Gi", "nvidia.com/gpu": "2"}}
        }"#;

        let node: Node = serde_json::from_str(raw).expect("node json");
        assert_eq!(node.capacity(ResourceKind::Cpu), Ok(4_000));
        assert_eq!(node.capacity(ResourceKind::Memory), Ok(1_073_741_824));
        assert_eq!(node.capacity(ResourceKind::Gpu), Ok(2));
    }

    #[test]
    fn test_missing_capacity_is_zero() {
        let node = Node::default();
        assert_eq!(node.capacity(ResourceKind::Gpu), Ok(0));
    }
}
