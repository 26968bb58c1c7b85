use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a cost figure represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostKind {
    Cpu,
    Memory,
    Gpu,
    Weighted,
    Node,
}

impl CostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Gpu => "gpu",
            Self::Weighted => "weighted",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for CostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cost figure with its dimensions, as sent to exporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub kind: CostKind,
    pub strategy: String,
    /// Micro-cents.
    pub value: i64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    pub end_time: DateTime<Utc>,
}

/// Identity under which records are merged before flushing.
///
/// Dimensions are compared as a map, so neither key order nor separator
/// characters inside values can make two different dimension sets collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CostRecordKey {
    pub kind: CostKind,
    pub strategy: String,
    pub dimensions: BTreeMap<String, String>,
}

impl CostRecord {
    pub fn key(&self) -> CostRecordKey {
        CostRecordKey {
            kind: self.kind,
            strategy: self.strategy.clone(),
            dimensions: self.dimensions.clone(),
        }
    }
}
