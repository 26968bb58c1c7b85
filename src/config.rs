use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::coster::filter::{WorkloadFilter, WorkloadFilters};
use crate::coster::mapper::Mapper;
use crate::coster::strategy::PricingStrategy;
use crate::coster::table::PricingTable;
use crate::export::codec::COMPRESSION_ALGORITHMS;

/// Top-level configuration for costmeter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Time between cost calculations. Default: 10s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Prometheus metrics and health server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Workload and node snapshot sources.
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Strategies evaluated every cycle. Default: all of them.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<PricingStrategy>,

    /// Ordered pricing entries; the first match wins.
    #[serde(default)]
    pub pricing: PricingTable,

    /// Dimension mapping rules.
    #[serde(default)]
    pub mapping: Mapper,

    /// Cost record destinations.
    #[serde(default)]
    pub exporters: ExportersConfig,

    /// Ingestion settings for `costmeter aggregate`.
    #[serde(default)]
    pub aggregate: AggregateConfig,
}

/// Snapshot inventory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Pod list snapshot (`kubectl get pods -A -o json`).
    #[serde(default)]
    pub pods_path: PathBuf,

    /// Node list snapshot (`kubectl get nodes -o json`).
    #[serde(default)]
    pub nodes_path: PathBuf,

    /// How often snapshots are reloaded. Default: 30s.
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Only cost workloads in the Running phase. Default: true.
    #[serde(default = "default_true")]
    pub running_only: bool,
}

/// Exporter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportersConfig {
    #[serde(default)]
    pub stats: StatsConfig,

    /// Buffering applied in front of the durable exporters.
    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub http: HttpExportConfig,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// Prometheus cost counter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Enable the per-dimension cost counter. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Buffering exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Time between buffer flushes. Default: 300s.
    #[serde(default = "default_buffer_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "costs".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Create the table on startup when missing. Default: true.
    #[serde(default = "default_true")]
    pub create_table: bool,

    /// Maximum rows per insert. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between inserts. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum records to queue; producers wait when full. Default: 8192.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

/// HTTP export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum items per batch. Default: 512.
    #[serde(default = "default_http_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a batch. Default: 5s.
    #[serde(default = "default_http_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Maximum duration for an export operation. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Maximum records to queue; producers wait when full. Default: 8192.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of concurrent workers. Default: 1.
    #[serde(default = "default_http_workers")]
    pub workers: usize,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":5000".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Aggregate mode ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// Largest accepted request body, after decompression. Default: 16MiB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_resync_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_strategies() -> Vec<PricingStrategy> {
    PricingStrategy::ALL.to_vec()
}

fn default_buffer_flush_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "costs".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_batch_size() -> usize {
    512
}

fn default_http_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_queue_size() -> usize {
    8192
}

fn default_http_workers() -> usize {
    1
}

fn default_health_addr() -> String {
    ":5000".to_string()
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            health: HealthConfig::default(),
            inventory: InventoryConfig::default(),
            strategies: default_strategies(),
            pricing: PricingTable::default(),
            mapping: Mapper::default(),
            exporters: ExportersConfig::default(),
            aggregate: AggregateConfig::default(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            pods_path: PathBuf::new(),
            nodes_path: PathBuf::new(),
            resync_interval: default_resync_interval(),
            running_only: true,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_buffer_flush_interval(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            create_table: true,
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_http_batch_size(),
            batch_timeout: default_http_batch_timeout(),
            export_timeout: default_http_export_timeout(),
            max_queue_size: default_max_queue_size(),
            workers: default_http_workers(),
            keep_alive: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl InventoryConfig {
    /// Filters applied to listed workloads before costing.
    pub fn filters(&self) -> WorkloadFilters {
        if self.running_only {
            WorkloadFilters(vec![WorkloadFilter::Running])
        } else {
            WorkloadFilters::default()
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration shared by every mode.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.exporters.buffer.flush_interval.is_zero() {
            bail!("exporters.buffer.flush_interval must be positive");
        }

        if self.pricing.fallback_count() > 1 {
            bail!("pricing.entries may contain at most one entry without labels");
        }

        for (idx, entry) in self.pricing.entries.iter().enumerate() {
            for (name, rate) in [
                ("hourlyMilliCPUCostMicroCents", entry.hourly_milli_cpu_cost_micro_cents),
                (
                    "hourlyMemoryByteCostMicroCents",
                    entry.hourly_memory_byte_cost_micro_cents,
                ),
                ("hourlyGPUCostMicroCents", entry.hourly_gpu_cost_micro_cents),
            ] {
                if !rate.is_finite() || rate < 0.0 {
                    bail!("pricing.entries[{idx}].{name} must be a non-negative number");
                }
            }
        }

        self.mapping
            .validate()
            .context("validating mapping.entries")?;

        // Validate HTTP export config if enabled.
        let http = &self.exporters.http;
        if http.enabled {
            if http.address.is_empty() {
                bail!("http address is required when enabled");
            }
            if http.max_queue_size == 0 {
                bail!("http max_queue_size must be positive when enabled");
            }
            if http.batch_size == 0 {
                bail!("http batch_size must be positive when enabled");
            }
            if http.workers == 0 {
                bail!("http workers must be positive when enabled");
            }
            if !COMPRESSION_ALGORITHMS.contains(&http.compression.as_str()) {
                bail!("invalid compression type: {}", http.compression);
            }
        }

        let ch = &self.exporters.clickhouse;
        if ch.enabled {
            if ch.endpoint.is_empty() {
                bail!("clickhouse endpoint is required when enabled");
            }
            if ch.batch_size == 0 {
                bail!("clickhouse batch_size must be positive when enabled");
            }
            if ch.max_queue_size == 0 {
                bail!("clickhouse max_queue_size must be positive when enabled");
            }
            if !is_identifier(&ch.database) || !is_identifier(&ch.table) {
                bail!("clickhouse database and table must be plain identifiers");
            }
        }

        Ok(())
    }

    /// Additional requirements of `costmeter collect`.
    pub fn validate_collect(&self) -> Result<()> {
        if self.inventory.pods_path.as_os_str().is_empty() {
            bail!("inventory.pods_path is required");
        }
        if self.inventory.nodes_path.as_os_str().is_empty() {
            bail!("inventory.nodes_path is required");
        }
        if self.inventory.resync_interval.is_zero() {
            bail!("inventory.resync_interval must be positive");
        }
        if self.strategies.is_empty() {
            bail!("at least one strategy is required");
        }
        if self.pricing.entries.is_empty() {
            bail!("pricing.entries must not be empty");
        }

        Ok(())
    }

    /// Additional requirements of `costmeter aggregate`.
    pub fn validate_aggregate(&self) -> Result<()> {
        if !self.exporters.clickhouse.enabled {
            bail!("exporters.clickhouse must be enabled in aggregate mode");
        }
        if self.aggregate.max_body_bytes == 0 {
            bail!("aggregate.max_body_bytes must be positive");
        }

        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
