use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::CostExporter;
use crate::coster::record::{CostRecord, CostRecordKey};
use crate::export::health::HealthMetrics;

/// Merges records by attribution key and forwards them on an interval.
///
/// Records sharing a [`CostRecordKey`] collapse into one: values are summed
/// and the most recently received timestamp is kept. The buffer is guarded by
/// a single mutex which is never held while the downstream exporter runs.
pub struct BufferingExporter {
    name: String,
    interval: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    next: CostExporter,
    buffer: parking_lot::Mutex<HashMap<CostRecordKey, CostRecord>>,
    health: Option<Arc<HealthMetrics>>,
}

impl BufferingExporter {
    pub fn new(next: CostExporter, interval: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            name: format!("buffering({})", next.name()),
            interval,
            shared: Arc::new(Shared {
                next,
                buffer: parking_lot::Mutex::new(HashMap::new()),
                health,
            }),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the downstream exporter, then the flush task.
    ///
    /// The flush task stops when `ctx` is cancelled or [`Self::stop`] is
    /// called, flushing one last time on the way out.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let shared = Arc::get_mut(&mut self.shared).context("buffering exporter already started")?;
        shared
            .next
            .start(ctx.clone())
            .await
            .context("starting downstream exporter")?;

        self.cancel = ctx.child_token();

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        shared.flush().await;
                        return;
                    }
                    _ = ticker.tick() => {
                        shared.flush().await;
                    }
                }
            }
        });

        *self.task.lock() = Some(task);

        tracing::info!(
            exporter = %self.name,
            flush_interval = ?self.interval,
            "Buffering exporter started",
        );

        Ok(())
    }

    /// Merges `record` into the buffer.
    pub fn export_cost(&self, record: CostRecord) {
        let len = {
            let mut buffer = self.shared.buffer.lock();
            match buffer.entry(record.key()) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    existing.value = existing.value.saturating_add(record.value);
                    existing.end_time = record.end_time;
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
            buffer.len()
        };

        self.shared.set_buffered(len);
    }

    /// Takes every buffered record, leaving the buffer empty.
    pub fn drain(&self) -> Vec<CostRecord> {
        self.shared.drain()
    }

    /// Forwards everything buffered so far to the downstream exporter.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Stops the flush task after its final flush, then the downstream exporter.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.context("joining buffering exporter task")?,
            None => self.shared.flush().await,
        }

        self.shared.next.stop().await
    }
}

impl Shared {
    fn drain(&self) -> Vec<CostRecord> {
        let drained = std::mem::take(&mut *self.buffer.lock());
        self.set_buffered(0);
        drained.into_values().collect()
    }

    async fn flush(&self) {
        let records = self.drain();

        if let Some(health) = &self.health {
            health.buffer_flushes.inc();
        }

        if records.is_empty() {
            return;
        }

        tracing::debug!(
            exporter = %self.next.name(),
            records = records.len(),
            "Flushing buffered cost records",
        );

        for record in records {
            self.next.export_cost(record).await;
        }
    }

    fn set_buffered(&self, len: usize) {
        if let Some(health) = &self.health {
            health
                .buffered_records
                .with_label_values(&[self.next.name()])
                .set(len as f64);
        }
    }
}
