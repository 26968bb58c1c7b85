use serde::Deserialize;

use crate::inventory::Workload;

/// Predicate deciding whether a workload is costed in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadFilter {
    /// Keeps workloads in the `Running` phase.
    Running,
}

impl WorkloadFilter {
    pub fn accepts(self, workload: &Workload) -> bool {
        match self {
            Self::Running => workload.is_running(),
        }
    }
}

/// Filters applied together; a workload must pass all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadFilters(pub Vec<WorkloadFilter>);

impl WorkloadFilters {
    pub fn all(&self, workload: &Workload) -> bool {
        self.0.iter().all(|f| f.accepts(workload))
    }

    /// Drops every workload that fails a filter.
    pub fn apply(&self, workloads: Vec<Workload>) -> Vec<Workload> {
        if self.0.is_empty() {
            return workloads;
        }
        workloads.into_iter().filter(|w| self.all(w)).collect()
    }
}
