use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{compress, content_encoding};
use super::health::HealthMetrics;
use crate::config::HttpExportConfig;
use crate::coster::record::CostRecord;

const EXPORTER_NAME: &str = "http";

/// HTTP NDJSON exporter with worker pool and compression.
///
/// Serializes cost records to newline-delimited JSON, optionally compresses,
/// and sends via HTTP POST. Uses a bounded channel and semaphore-limited
/// workers for backpressure; a full queue makes callers wait. Records that
/// cannot be delivered are counted in `export_errors_total{exporter="http"}` and dropped.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    health: Option<Arc<HealthMetrics>>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<CostRecord>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            health,
            tx: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        EXPORTER_NAME
    }

    /// Start the background accumulator task.
    ///
    /// The accumulator runs until [`HttpExporter::stop`] closes the queue,
    /// so records flushed during shutdown are still delivered.
    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("http max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("http workers must be positive");
        }

        let (tx, mut rx) = mpsc::channel::<CostRecord>(self.cfg.max_queue_size);

        let cfg = Arc::new(self.cfg.clone());
        let health = self.health.clone();

        // Build reqwest client.
        let mut client_builder = reqwest::Client::builder().timeout(cfg.export_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        let semaphore = Arc::new(Semaphore::new(cfg.workers));

        // Spawn accumulator task that batches items and dispatches to workers.
        let task = tokio::spawn(async move {
            let batch_size = cfg.batch_size.max(1);
            let mut batch = Vec::with_capacity(batch_size);
            let mut in_flight = tokio::task::JoinSet::new();
            let mut interval = tokio::time::interval(cfg.batch_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let sender = BatchSender {
                client,
                cfg: Arc::clone(&cfg),
                semaphore,
                health,
            };

            loop {
                tokio::select! {
                    item = rx.recv() => {
                        match item {
                            Some(item) => {
                                batch.push(item);

                                // Drain more items without blocking.
                                while batch.len() < batch_size {
                                    match rx.try_recv() {
                                        Ok(item) => batch.push(item),
                                        Err(_) => break,
                                    }
                                }

                                if batch.len() >= batch_size {
                                    let items = std::mem::replace(
                                        &mut batch,
                                        Vec::with_capacity(batch_size),
                                    );
                                    sender.spawn(&mut in_flight, items);
                                }
                            }
                            None => {
                                sender.spawn(&mut in_flight, std::mem::take(&mut batch));

                                while let Some(joined) = in_flight.join_next().await {
                                    if let Err(e) = joined {
                                        tracing::debug!(error = %e, "HTTP export worker join failed");
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            let items = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(batch_size),
                            );
                            sender.spawn(&mut in_flight, items);
                        }
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            tracing::debug!(error = %e, "HTTP export worker join failed");
                        }
                    }
                }
            }
        });

        *self.tx.lock() = Some(tx);
        *self.task.lock() = Some(task);

        tracing::info!(
            address = %self.cfg.address,
            compression = %self.cfg.compression,
            workers = self.cfg.workers,
            "HTTP exporter started",
        );

        Ok(())
    }

    /// Enqueue a record, waiting for queue space.
    ///
    /// The record is dropped only when the exporter is not running.
    pub async fn export_cost(&self, record: CostRecord) {
        let tx = self.tx.lock().clone();
        let sent = match tx {
            Some(tx) => tx.send(record).await.is_ok(),
            None => false,
        };

        if !sent {
            tracing::warn!("HTTP export queue closed, dropping record");
            if let Some(health) = &self.health {
                health.export_errors.with_label_values(&[EXPORTER_NAME]).inc();
            }
        }
    }

    /// Stop the exporter, delivering everything already queued.
    pub async fn stop(&self) -> Result<()> {
        // Drop the sender to signal the accumulator to stop.
        self.tx.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining HTTP exporter task")?;
        }

        Ok(())
    }
}

/// Everything a worker needs to deliver one batch.
struct BatchSender {
    client: reqwest::Client,
    cfg: Arc<HttpExportConfig>,
    semaphore: Arc<Semaphore>,
    health: Option<Arc<HealthMetrics>>,
}

impl BatchSender {
    fn spawn(&self, in_flight: &mut tokio::task::JoinSet<()>, items: Vec<CostRecord>) {
        if items.is_empty() {
            return;
        }

        let client = self.client.clone();
        let cfg = Arc::clone(&self.cfg);
        let semaphore = Arc::clone(&self.semaphore);
        let health = self.health.clone();

        in_flight.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP exporter semaphore closed");
                    return;
                }
            };

            let _permit = permit;

            let count = items.len();
            let started = Instant::now();
            let result = send_batch(&client, &cfg, &items).await;

            if let Some(health) = &health {
                health
                    .export_batch_duration
                    .with_label_values(&[EXPORTER_NAME])
                    .observe(started.elapsed().as_secs_f64());
            }

            if let Err(e) = result {
                tracing::warn!(error = %e, records = count, "HTTP export request failed");
                if let Some(health) = &health {
                    health
                        .export_errors
                        .with_label_values(&[EXPORTER_NAME])
                        .inc_by(count as f64);
                }
            }
        });
    }
}

/// Serializes records as newline-delimited JSON.
pub fn encode_ndjson(records: &[CostRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(&mut buf, record).context("serializing cost record to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Sends one batch of records via HTTP.
async fn send_batch(
    client: &reqwest::Client,
    cfg: &HttpExportConfig,
    records: &[CostRecord],
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let buf = encode_ndjson(records)?;
    let raw_len = buf.len();

    // Compress.
    let compressed = compress(&buf, &cfg.compression).context("compressing NDJSON data")?;

    // Build request.
    let mut request = client
        .post(&cfg.address)
        .header("Content-Type", "application/x-ndjson")
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    // Add custom headers.
    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    // Send.
    let resp = request
        .send()
        .await
        .context("sending HTTP export request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("HTTP export unexpected status: {status}");
    }

    tracing::debug!(
        records = records.len(),
        bytes = raw_len,
        "exported batch via HTTP",
    );

    Ok(())
}
