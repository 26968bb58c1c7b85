use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::HealthMetrics;
use crate::config::ClickHouseConfig;
use crate::coster::record::CostRecord;

const EXPORTER_NAME: &str = "clickhouse";

/// Prefix of the per-destination dimension columns.
pub const DIMENSION_COLUMN_PREFIX: &str = "dimensions_";

/// ClickHouse exporter for cost records.
///
/// Every record becomes one row holding the full dimension map as a JSON
/// string plus one `dimensions_<destination>` column per configured mapping
/// destination. Records are queued and inserted in batches.
pub struct ClickHouseExporter {
    cfg: ClickHouseConfig,
    destinations: Arc<[String]>,
    health: Option<Arc<HealthMetrics>>,
    inserter: Option<Inserter>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<CostRecord>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClickHouseExporter {
    /// Creates a new ClickHouse exporter writing the given dimension columns.
    pub fn new(
        cfg: ClickHouseConfig,
        destinations: Vec<String>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg,
            destinations: destinations.into(),
            health,
            inserter: None,
            tx: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        EXPORTER_NAME
    }

    /// Connects, provisions the table if configured and starts the
    /// batching task.
    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        if self.inserter.is_some() {
            bail!("ClickHouse exporter already started");
        }

        let pool = connect(&self.cfg).await?;
        let table = qualified_table(&self.cfg);

        let inserter = Inserter {
            pool,
            table: table.clone(),
            destinations: Arc::clone(&self.destinations),
            health: self.health.clone(),
        };

        if self.cfg.create_table {
            inserter.ensure_table().await?;
        }

        let (tx, rx) = mpsc::channel::<CostRecord>(self.cfg.max_queue_size.max(1));
        let task = tokio::spawn(run_batcher(
            inserter.clone(),
            self.cfg.batch_size,
            self.cfg.flush_interval,
            rx,
        ));

        *self.tx.lock() = Some(tx);
        *self.task.lock() = Some(task);
        self.inserter = Some(inserter);

        tracing::info!(
            %table,
            dimensions = self.destinations.len(),
            "ClickHouse exporter started",
        );

        Ok(())
    }

    /// Enqueue a record, waiting while the batcher catches up. Dropped only
    /// when the exporter is not running.
    pub async fn export_cost(&self, record: CostRecord) {
        let tx = self.tx.lock().clone();
        let sent = match tx {
            Some(tx) => tx.send(record).await.is_ok(),
            None => false,
        };

        if !sent {
            tracing::warn!("ClickHouse export queue closed, dropping record");
            record_errors(self.health.as_deref(), 1);
        }
    }

    /// Inserts `records` immediately, bypassing the queue.
    pub async fn insert_batch(&self, records: &[CostRecord]) -> Result<()> {
        match &self.inserter {
            Some(inserter) => inserter.insert(records).await,
            None => bail!("ClickHouse exporter not started"),
        }
    }

    /// Closes the queue and waits for the final batch to be inserted.
    pub async fn stop(&self) -> Result<()> {
        self.tx.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining ClickHouse exporter task")?;
        }

        Ok(())
    }
}

/// Owns what a batch insert needs; cloned into the batching task.
#[derive(Clone)]
struct Inserter {
    pool: Pool,
    table: String,
    destinations: Arc<[String]>,
    health: Option<Arc<HealthMetrics>>,
}

impl Inserter {
    async fn ensure_table(&self) -> Result<()> {
        let sql = create_table_sql(&self.table, &self.destinations);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for table creation")?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("creating table {}", self.table))?;

        tracing::info!(table = %self.table, "ClickHouse table ensured");

        Ok(())
    }

    async fn insert(&self, records: &[CostRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let sql = insert_sql(&self.table, &self.destinations, records)?;
        let started = Instant::now();

        let result = async {
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for cost insert")?;

            handle
                .execute(sql.as_str())
                .await
                .context("sending cost batch")
        }
        .await;

        if let Some(health) = &self.health {
            health
                .export_batch_duration
                .with_label_values(&[EXPORTER_NAME])
                .observe(started.elapsed().as_secs_f64());
        }

        if result.is_err() {
            record_errors(self.health.as_deref(), records.len());
        }

        result
    }
}

fn record_errors(health: Option<&HealthMetrics>, count: usize) {
    if let Some(health) = health {
        health
            .export_errors
            .with_label_values(&[EXPORTER_NAME])
            .inc_by(count as f64);
    }
}

/// Batches queued records by size and time until the queue closes.
async fn run_batcher(
    inserter: Inserter,
    batch_size: usize,
    flush_interval: Duration,
    mut rx: mpsc::Receiver<CostRecord>,
) {
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            flush(&inserter, &mut batch).await;
                        }
                    }
                    None => {
                        flush(&inserter, &mut batch).await;
                        return;
                    }
                }
            }

            _ = interval.tick() => {
                flush(&inserter, &mut batch).await;
            }
        }
    }
}

async fn flush(inserter: &Inserter, batch: &mut Vec<CostRecord>) {
    if batch.is_empty() {
        return;
    }

    let records = std::mem::take(batch);
    if let Err(e) = inserter.insert(&records).await {
        tracing::warn!(error = %e, records = records.len(), "ClickHouse insert failed");
    }
}

/// Opens a pool against the native TCP endpoint and pings it once.
async fn connect(cfg: &ClickHouseConfig) -> Result<Pool> {
    let pool = Pool::new(dsn(cfg));

    let mut handle = pool
        .get_handle()
        .await
        .with_context(|| format!("connecting to ClickHouse at {}", cfg.endpoint))?;
    handle.ping().await.context("pinging ClickHouse")?;

    tracing::debug!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse reachable");

    Ok(pool)
}

/// `tcp://[user[:pass]@]host:port/database?options` for clickhouse-rs.
///
/// Inserts are few and large, so the pool stays small.
fn dsn(cfg: &ClickHouseConfig) -> String {
    let auth = match (cfg.username.as_str(), cfg.password.as_str()) {
        ("", _) => String::new(),
        (user, "") => format!("{user}@"),
        (user, pass) => format!("{user}:{pass}@"),
    };

    format!(
        "tcp://{auth}{}/{}?compression=lz4&pool_min=1&pool_max=4",
        cfg.endpoint, cfg.database
    )
}

fn qualified_table(cfg: &ClickHouseConfig) -> String {
    format!("{}.{}", cfg.database, cfg.table)
}

// --- SQL formatting helpers ---

/// Builds the CREATE TABLE statement for `table` with one column per
/// dimension destination.
pub fn create_table_sql(table: &str, destinations: &[String]) -> String {
    let mut sql = String::with_capacity(256 + destinations.len() * 48);
    let _ = write!(
        sql,
        "CREATE TABLE IF NOT EXISTS {table} (\
         end_time DateTime64(3, 'UTC'), \
         kind LowCardinality(String), \
         strategy LowCardinality(String), \
         value Int64, \
         dimensions String"
    );
    for dest in destinations {
        let _ = write!(sql, ", {DIMENSION_COLUMN_PREFIX}{dest} String");
    }
    sql.push_str(") ENGINE = MergeTree ORDER BY (kind, strategy, end_time)");
    sql
}

/// Builds a multi-row INSERT for `records`.
pub fn insert_sql(table: &str, destinations: &[String], records: &[CostRecord]) -> Result<String> {
    let mut columns = String::from("end_time, kind, strategy, value, dimensions");
    for dest in destinations {
        let _ = write!(columns, ", {DIMENSION_COLUMN_PREFIX}{dest}");
    }

    let mut sql = String::with_capacity(64 + table.len() + columns.len() + records.len() * 160);
    let _ = write!(sql, "INSERT INTO {table} ({columns}) VALUES ");

    for (idx, r) in records.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let dims = serde_json::to_string(&r.dimensions).context("serializing dimensions")?;
        let _ = write!(
            sql,
            "({}, '{}', '{}', {}, '{}'",
            format_datetime(r.end_time),
            r.kind.as_str(),
            escape_sql(&r.strategy),
            r.value,
            escape_sql(&dims),
        );
        for dest in destinations {
            let value = r.dimensions.get(dest).map(String::as_str).unwrap_or("");
            let _ = write!(sql, ", '{}'", escape_sql(value));
        }
        sql.push(')');
    }

    Ok(sql)
}

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
