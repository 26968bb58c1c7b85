use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Inventory, Node, Workload};
use crate::export::health::HealthMetrics;

#[derive(Debug, Error)]
pub enum ListerError {
    #[error("{0} cache has not synced yet")]
    CacheNotSynced(&'static str),
}

/// Objects stored in a snapshot cache.
pub trait Keyed {
    fn cache_key(&self) -> String;
}

impl Keyed for Workload {
    fn cache_key(&self) -> String {
        self.key()
    }
}

impl Keyed for Node {
    fn cache_key(&self) -> String {
        self.key()
    }
}

/// Accepts both `kubectl get -o json` list output and a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile<T> {
    List { items: Vec<T> },
    Items(Vec<T>),
}

impl<T> SnapshotFile<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Self::List { items } => items,
            Self::Items(items) => items,
        }
    }
}

/// Cached lister backed by a periodically reloaded snapshot file.
///
/// Each resync builds a fresh map and swaps it in whole, so readers always
/// see a complete snapshot from one load.
pub struct SnapshotLister<T> {
    source: &'static str,
    path: PathBuf,
    resync_interval: Duration,
    store: parking_lot::RwLock<Arc<HashMap<String, T>>>,
    synced: AtomicBool,
    health: Option<Arc<HealthMetrics>>,
}

impl<T> SnapshotLister<T>
where
    T: Keyed + Clone + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        source: &'static str,
        path: impl Into<PathBuf>,
        resync_interval: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            path: path.into(),
            resync_interval,
            store: parking_lot::RwLock::new(Arc::default()),
            synced: AtomicBool::new(false),
            health,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Reloads the snapshot file into the cache. Returns the object count.
    pub fn sync(&self) -> Result<usize> {
        let items: Vec<T> = load_snapshot(&self.path)
            .with_context(|| format!("loading {} snapshot", self.source))?;

        let snapshot: HashMap<String, T> = items
            .into_iter()
            .map(|item| (item.cache_key(), item))
            .collect();
        let count = snapshot.len();
        *self.store.write() = Arc::new(snapshot);

        self.synced.store(true, Ordering::Release);

        if let Some(health) = &self.health {
            health
                .inventory_objects
                .with_label_values(&[self.source])
                .set(count as f64);
        }

        Ok(count)
    }

    /// Returns a copy of every cached object.
    pub fn list(&self) -> Result<Vec<T>> {
        if !self.has_synced() {
            return Err(ListerError::CacheNotSynced(self.source).into());
        }

        let snapshot = Arc::clone(&*self.store.read());
        Ok(snapshot.values().cloned().collect())
    }

    /// Keeps the cache in sync until cancelled.
    ///
    /// The initial load must succeed; later failures keep the previous
    /// snapshot and are reported through metrics.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let count = self
            .sync()
            .with_context(|| format!("{} cache sync failed", self.source))?;
        info!(source = self.source, objects = count, "inventory cache synced");

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately; the initial sync already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(source = self.source, "inventory sync loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.sync() {
                        Ok(count) => {
                            debug!(source = self.source, objects = count, "inventory resynced");
                        }
                        Err(e) => {
                            warn!(source = self.source, error = %e, "inventory resync failed");
                            if let Some(health) = &self.health {
                                health
                                    .inventory_sync_errors
                                    .with_label_values(&[self.source])
                                    .inc();
                            }
                        }
                    }
                }
            }
        }
    }
}

fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot file {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let file: SnapshotFile<T> = if is_json {
        serde_json::from_str(&data)
            .with_context(|| format!("parsing snapshot file {}", path.display()))?
    } else {
        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing snapshot file {}", path.display()))?
    };

    Ok(file.into_items())
}

/// Inventory served from the pod and node snapshot caches.
pub struct SnapshotInventory {
    pub pods: Arc<SnapshotLister<Workload>>,
    pub nodes: Arc<SnapshotLister<Node>>,
}

impl Inventory for SnapshotInventory {
    fn list_workloads(&self) -> Result<Vec<Workload>> {
        self.pods.list()
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        self.nodes.list()
    }
}
