//! Cluster cost attribution: prices workload resource requests against a
//! label-matched pricing table and exports the resulting cost records.

pub mod agent;
pub mod config;
pub mod coster;
pub mod export;
pub mod inventory;
