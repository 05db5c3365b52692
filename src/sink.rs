//! # Stage: Batching Sink
//!
//! ## Responsibility
//! Buffers readings from the ingestion bus and submits batches to the
//! downstream [`TimeSeriesSink`]. Flush triggers: size threshold, flush
//! interval, or the final flush during shutdown. Transient failures retry
//! the same batch with exponential backoff before any newer data; permanent
//! failures discard the batch and surface through health.
//!
//! ## Guarantees
//! - Batches are delivered in submission order; a retried batch goes out
//!   before anything newer
//! - While a batch is being retried, new readings accumulate in a secondary
//!   buffer capped at `2 · batch_size` (drop-oldest beyond that)
//! - A size trigger and an interval trigger landing together produce exactly
//!   one flush (the timer is reset after every flush)
//! - Shutdown performs one bounded final flush attempt and reports any
//!   remainder instead of retrying forever
//!
//! ## NOT Responsible For
//! - Duplicate suppression on retry: sample identity is
//!   `(device_id, channel, timestamp)` and the downstream store or adapter
//!   deduplicates on it
//! - Producing readings (device loops) or transporting them (the bus)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::BusReceiver;
use crate::config::CollectorConfig;
use crate::error::SinkError;
use crate::metrics::{Counter, Histogram, MetricsRegistry};
use crate::reading::Reading;

/// Capability contract for the downstream time-series store.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Accept the whole batch or fail with a classified error.
    async fn write_batch(&self, batch: &[Reading]) -> Result<(), SinkError>;

    /// Final flush hook for adapters that buffer internally. Must return
    /// within `deadline`.
    async fn shutdown(&self, deadline: Duration) -> Result<(), SinkError> {
        let _ = deadline;
        Ok(())
    }
}

/// Sink health as reported to the fleet aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkHealth {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug)]
struct StatusFields {
    last_flush_ok_at: Instant,
    retrying: bool,
    failed: bool,
    pending: usize,
}

struct StatusState {
    fields: Mutex<StatusFields>,
    flush_interval: Duration,
}

/// Shared, read-only view of the writer's health. Clone freely.
#[derive(Clone)]
pub struct SinkStatus {
    inner: Arc<StatusState>,
}

impl SinkStatus {
    fn new(flush_interval: Duration) -> Self {
        SinkStatus {
            inner: Arc::new(StatusState {
                fields: Mutex::new(StatusFields {
                    last_flush_ok_at: Instant::now(),
                    retrying: false,
                    failed: false,
                    pending: 0,
                }),
                flush_interval,
            }),
        }
    }

    pub fn health(&self) -> SinkHealth {
        let f = self.inner.fields.lock().expect("sink status lock poisoned");
        if f.failed {
            SinkHealth::Failed
        } else if f.retrying {
            SinkHealth::Degraded
        } else if f.last_flush_ok_at.elapsed() <= 2 * self.inner.flush_interval {
            SinkHealth::Healthy
        } else {
            SinkHealth::Degraded
        }
    }

    /// Readings currently buffered in the writer.
    pub fn pending(&self) -> usize {
        self.inner.fields.lock().expect("sink status lock poisoned").pending
    }

    fn note_success(&self) {
        let mut f = self.inner.fields.lock().expect("sink status lock poisoned");
        f.last_flush_ok_at = Instant::now();
        f.retrying = false;
        f.failed = false;
    }

    fn note_retrying(&self) {
        let mut f = self.inner.fields.lock().expect("sink status lock poisoned");
        f.retrying = true;
    }

    fn note_failed(&self) {
        let mut f = self.inner.fields.lock().expect("sink status lock poisoned");
        f.retrying = false;
        f.failed = true;
    }

    fn set_pending(&self, n: usize) {
        let mut f = self.inner.fields.lock().expect("sink status lock poisoned");
        f.pending = n;
    }
}

/// Tunables for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        BatchWriterConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

impl BatchWriterConfig {
    pub fn from_collector(cfg: &CollectorConfig) -> Self {
        BatchWriterConfig {
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval(),
            max_retries: cfg.max_retries,
            shutdown_deadline: cfg.shutdown_deadline(),
            ..Default::default()
        }
    }

    fn secondary_cap(&self) -> usize {
        self.batch_size * 2
    }
}

struct WriterMetrics {
    batches_ok: Counter,
    batches_transient: Counter,
    batches_permanent: Counter,
    retries: Counter,
    dropped: Counter,
    flush_latency: Histogram,
}

impl WriterMetrics {
    fn register(registry: &MetricsRegistry) -> Self {
        WriterMetrics {
            batches_ok: registry.counter(
                "sink_batches_total",
                "Batch submissions by result",
                &[("result", "ok")],
            ),
            batches_transient: registry.counter(
                "sink_batches_total",
                "Batch submissions by result",
                &[("result", "transient_error")],
            ),
            batches_permanent: registry.counter(
                "sink_batches_total",
                "Batch submissions by result",
                &[("result", "permanent_error")],
            ),
            retries: registry.counter("sink_retries_total", "Batch submit retries", &[]),
            dropped: registry.counter(
                "sink_dropped_total",
                "Readings discarded by the sink",
                &[],
            ),
            flush_latency: registry.histogram(
                "sink_flush_latency_seconds",
                "End-to-end flush latency including retries",
                &[],
            ),
        }
    }
}

/// The sink worker. Owns its buffers exclusively; runs until the bus closes.
pub struct BatchWriter {
    sink: Arc<dyn TimeSeriesSink>,
    cfg: BatchWriterConfig,
    status: SinkStatus,
    metrics: WriterMetrics,
    buffer: Vec<Reading>,
    rx: BusReceiver,
}

impl BatchWriter {
    pub fn new(
        sink: Arc<dyn TimeSeriesSink>,
        cfg: BatchWriterConfig,
        rx: BusReceiver,
        registry: &MetricsRegistry,
    ) -> (Self, SinkStatus) {
        let status = SinkStatus::new(cfg.flush_interval);
        let writer = BatchWriter {
            sink,
            metrics: WriterMetrics::register(registry),
            status: status.clone(),
            buffer: Vec::with_capacity(cfg.batch_size),
            cfg,
            rx,
        };
        let status_out = writer.status.clone();
        (writer, status_out)
    }

    /// Main loop: accumulate, flush on size or interval, exit when the bus
    /// closes, then run the bounded final flush.
    pub async fn run(mut self) {
        let period = self.cfg.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        enum Event {
            Tick,
            Received(Option<Reading>),
        }

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                maybe = self.rx.recv() => Event::Received(maybe),
            };
            match event {
                Event::Tick => {
                    if self.buffer.is_empty() {
                        // nothing to ship counts as a healthy, vacuous flush
                        self.status.note_success();
                    } else {
                        self.flush().await;
                        ticker.reset();
                    }
                }
                Event::Received(Some(reading)) => {
                    self.buffer.push(reading);
                    self.status.set_pending(self.buffer.len());
                    if self.buffer.len() >= self.cfg.batch_size {
                        self.flush().await;
                        ticker.reset();
                    }
                }
                Event::Received(None) => break,
            }
        }

        self.final_flush().await;
    }

    /// Submit the current buffer, retrying transient failures with backoff
    /// while newer readings pile into a bounded secondary buffer.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let flush_id = Uuid::new_v4();
        let started = Instant::now();
        let mut overflow: Vec<Reading> = Vec::new();
        let mut overflow_dropped = 0u64;
        let mut attempt: u32 = 0;

        loop {
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    self.metrics.batches_ok.inc();
                    self.metrics.flush_latency.observe(started.elapsed().as_secs_f64());
                    self.status.note_success();
                    debug!(%flush_id, batch = batch.len(), attempt, "batch flushed");
                    break;
                }
                Err(SinkError::Permanent(detail)) => {
                    self.metrics.batches_permanent.inc();
                    self.metrics.dropped.add(batch.len() as u64);
                    self.status.note_failed();
                    error!(%flush_id, batch = batch.len(), %detail, "batch rejected, discarding");
                    break;
                }
                Err(SinkError::Transient(detail)) => {
                    self.metrics.batches_transient.inc();
                    if attempt >= self.cfg.max_retries {
                        self.metrics.dropped.add(batch.len() as u64);
                        self.status.note_failed();
                        error!(
                            %flush_id,
                            batch = batch.len(),
                            attempts = attempt + 1,
                            %detail,
                            "retries exhausted, discarding batch"
                        );
                        break;
                    }
                    let delay = retry_delay(self.cfg.retry_base, self.cfg.retry_cap, attempt);
                    attempt += 1;
                    self.metrics.retries.inc();
                    self.status.note_retrying();
                    warn!(%flush_id, attempt, ?delay, %detail, "transient sink failure, backing off");
                    overflow_dropped += self.drain_during(delay, &mut overflow).await;
                }
            }
        }

        if overflow_dropped > 0 {
            self.metrics.dropped.add(overflow_dropped);
            warn!(%flush_id, dropped = overflow_dropped, "secondary buffer overflowed during retry");
        }
        self.buffer = overflow;
        self.status.set_pending(self.buffer.len());
    }

    /// Sleep out a retry backoff while still consuming the bus into the
    /// secondary buffer. Returns how many readings had to be dropped to
    /// respect the `2 · batch_size` cap.
    async fn drain_during(&mut self, delay: Duration, overflow: &mut Vec<Reading>) -> u64 {
        let cap = self.cfg.secondary_cap();
        let mut dropped = 0u64;
        let until = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= until {
                return dropped;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return dropped,
                maybe = self.rx.recv() => match maybe {
                    Some(reading) => {
                        if overflow.len() == cap {
                            overflow.remove(0);
                            dropped += 1;
                        }
                        overflow.push(reading);
                    }
                    // bus closed mid-retry: just finish the backoff
                    None => {
                        tokio::time::sleep_until(until).await;
                        return dropped;
                    }
                },
            }
        }
    }

    /// One bounded attempt to ship whatever is left, then the adapter's own
    /// shutdown hook. Any remainder is reported, not retried.
    async fn final_flush(mut self) {
        let deadline = self.cfg.shutdown_deadline;
        let overall = Instant::now();

        // pick up stragglers published while the loops were stopping
        while let Some(reading) = self.rx.try_recv() {
            self.buffer.push(reading);
        }

        if !self.buffer.is_empty() {
            let batch = std::mem::take(&mut self.buffer);
            info!(remaining = batch.len(), "final flush");
            match timeout(deadline, self.sink.write_batch(&batch)).await {
                Ok(Ok(())) => {
                    self.metrics.batches_ok.inc();
                    self.status.note_success();
                }
                Ok(Err(e)) => {
                    self.metrics.dropped.add(batch.len() as u64);
                    self.status.note_failed();
                    error!(error = %e, lost = batch.len(), "final flush failed");
                }
                Err(_) => {
                    self.metrics.dropped.add(batch.len() as u64);
                    self.status.note_failed();
                    error!(lost = batch.len(), "final flush exceeded shutdown deadline");
                }
            }
        }

        let remaining = deadline.saturating_sub(overall.elapsed());
        if let Err(e) = timeout(remaining.max(Duration::from_millis(1)), self.sink.shutdown(remaining))
            .await
            .unwrap_or_else(|_| Err(SinkError::Transient("sink shutdown timed out".into())))
        {
            warn!(error = %e, "sink shutdown hook failed");
        }
        self.status.set_pending(0);
    }
}

fn retry_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

/// Fallback sink used when no downstream store is configured: logs batch
/// summaries and drops the data.
pub struct LogSink;

#[async_trait]
impl TimeSeriesSink for LogSink {
    async fn write_batch(&self, batch: &[Reading]) -> Result<(), SinkError> {
        info!(
            readings = batch.len(),
            first = batch.first().map(|r| r.timestamp_ms).unwrap_or(0),
            last = batch.last().map(|r| r.timestamp_ms).unwrap_or(0),
            "batch (log sink)"
        );
        Ok(())
    }
}
