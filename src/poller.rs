//! # Stage: Device Loop
//!
//! ## Responsibility
//! One cooperative worker per device: wait for the poll slot, read every
//! enabled channel over the device's own transport, decode, derive rates,
//! classify quality, publish to the ingestion bus, and keep the device's
//! health record current.
//!
//! ## Guarantees
//! - At most one inflight poll per device at any time
//! - `poll_interval` is start-to-start; an overrunning poll starts the next
//!   one immediately and increments the slip counter, but slots are never
//!   queued up — at most one missed slot is absorbed
//! - Published timestamps are strictly increasing per channel (clamped to
//!   `last + 1 ms` against wall-clock steps)
//! - Cancellation lets an inflight read finish up to `read_timeout`,
//!   publishes its readings, and initiates nothing further
//!
//! ## NOT Responsible For
//! - Batching and delivery (the sink)
//! - Fleet aggregation (the health registry is only written here)

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::bus::IngestionBus;
use crate::config::{CollectorConfig, DeviceConfig};
use crate::error::TransportError;
use crate::health::HealthRegistry;
use crate::metrics::{Counter, Gauge, Histogram, MetricsRegistry};
use crate::modbus::decode::decode_counter;
use crate::modbus::ModbusTransport;
use crate::process::{process_failure, process_sample};
use crate::rate::{RateEngine, RateOutcome};
use crate::reading::{Quality, RawSample};

/// First backoff step after a failed poll cycle.
const BACKOFF_BASE_MS: u64 = 500;

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct LoopMetrics {
    reads_total: Counter,
    fail_timeout: Counter,
    fail_connection: Counter,
    fail_exception: Counter,
    read_latency: Histogram,
    poll_slips: Counter,
    device_up: Gauge,
    rate_gauges: HashMap<u16, Gauge>,
}

impl LoopMetrics {
    fn register(registry: &MetricsRegistry, device: &DeviceConfig) -> Self {
        let id = device.device_id.as_str();
        let mut rate_gauges = HashMap::new();
        for ch in device.enabled_channels() {
            let channel = ch.channel_number.to_string();
            rate_gauges.insert(
                ch.channel_number,
                registry.gauge(
                    "rate_gauge",
                    "Latest derived rate in pulses per second",
                    &[("device", id), ("channel", &channel)],
                ),
            );
        }
        LoopMetrics {
            reads_total: registry.counter("reads_total", "Register reads issued", &[("device", id)]),
            fail_timeout: registry.counter(
                "read_failures_total",
                "Failed reads by reason",
                &[("device", id), ("reason", "timeout")],
            ),
            fail_connection: registry.counter(
                "read_failures_total",
                "Failed reads by reason",
                &[("device", id), ("reason", "connection_lost")],
            ),
            fail_exception: registry.counter(
                "read_failures_total",
                "Failed reads by reason",
                &[("device", id), ("reason", "remote_exception")],
            ),
            read_latency: registry.histogram(
                "read_latency_seconds",
                "Acquisition latency per poll cycle",
                &[("device", id)],
            ),
            poll_slips: registry.counter(
                "poll_slips_total",
                "Poll slots that started late because the previous poll overran",
                &[("device", id)],
            ),
            device_up: registry.gauge(
                "device_up",
                "1 while the device answers polls",
                &[("device", id)],
            ),
            rate_gauges,
        }
    }

    fn failure_counter(&self, err: &TransportError) -> &Counter {
        match err {
            TransportError::Timeout(_)         => &self.fail_timeout,
            TransportError::ConnectionLost(_)  => &self.fail_connection,
            TransportError::RemoteException(_) => &self.fail_exception,
        }
    }
}

/// The per-device worker. Owns its transport, rate history and carry-over
/// state exclusively; nothing here is shared with other devices.
pub struct DevicePoller {
    device: DeviceConfig,
    transport: Box<dyn ModbusTransport>,
    bus: IngestionBus,
    health: HealthRegistry,
    rate: RateEngine,
    metrics: LoopMetrics,
    poll_interval: Duration,
    max_retries: u32,
    shutdown: watch::Receiver<bool>,
    last_good: HashMap<u16, f64>,
    last_ts: HashMap<u16, u64>,
    decode_error_logged: HashSet<u16>,
}

impl DevicePoller {
    pub fn new(
        device: DeviceConfig,
        global: &CollectorConfig,
        transport: Box<dyn ModbusTransport>,
        bus: IngestionBus,
        health: HealthRegistry,
        registry: &MetricsRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let metrics = LoopMetrics::register(registry, &device);
        let poll_interval = device.poll_interval(global);
        let max_retries = device.max_retries(global);
        DevicePoller {
            rate: RateEngine::new(global.rate_window_samples),
            metrics,
            poll_interval,
            max_retries,
            transport,
            bus,
            health,
            shutdown,
            last_good: HashMap::new(),
            last_ts: HashMap::new(),
            decode_error_logged: HashSet::new(),
            device,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until the shutdown flag flips (or the sender is gone).
    async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        self.health.register(&self.device.device_id);
        info!(
            device = %self.device.device_id,
            addr = %self.device.addr(),
            interval_ms = self.poll_interval.as_millis() as u64,
            channels = self.device.enabled_channels().count(),
            "device loop started"
        );

        let mut next_poll = Instant::now();
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = sleep_until(next_poll) => {}
                _ = Self::shutdown_signal(&mut shutdown) => break,
            }

            let outcome = self.poll_cycle().await;

            match outcome {
                Ok(acquisition) => {
                    self.health.record_success(&self.device.device_id, acquisition);
                    self.metrics.device_up.set(1.0);
                    self.metrics.read_latency.observe(acquisition.as_secs_f64());

                    // start-to-start schedule with one-slot absorption
                    next_poll += self.poll_interval;
                    let now = Instant::now();
                    if next_poll <= now {
                        self.metrics.poll_slips.inc();
                        next_poll = now;
                    }
                }
                Err(err) => {
                    let consecutive = self
                        .health
                        .record_failure(&self.device.device_id, &err.to_string());
                    self.metrics.device_up.set(0.0);
                    let n = consecutive.min(self.max_retries);
                    let delay = backoff_with_jitter(n, self.poll_interval);
                    warn!(
                        device = %self.device.device_id,
                        error = %err,
                        consecutive,
                        backoff_ms = delay.as_millis() as u64,
                        "poll cycle failed"
                    );

                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = Self::shutdown_signal(&mut shutdown) => break,
                    }
                    next_poll = Instant::now();
                }
            }

            if self.shutting_down() {
                break;
            }
        }

        info!(device = %self.device.device_id, "device loop stopped");
    }

    /// Read, decode and publish every enabled channel once. The first
    /// transport error fails the cycle; channels after it publish failure
    /// readings for this round so downstream sees the gap explicitly.
    async fn poll_cycle(&mut self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let mut failure: Option<TransportError> = None;

        for i in 0..self.device.channels.len() {
            if !self.device.channels[i].enabled {
                continue;
            }
            if let Some(err) = &failure {
                let err = err.clone();
                self.publish_channel_failure(i, &err);
                continue;
            }

            let (start_register, register_count) = {
                let ch = &self.device.channels[i];
                (ch.start_register, ch.register_count)
            };
            self.metrics.reads_total.inc();
            let read_started = Instant::now();
            match self.transport.read_holding(start_register, register_count).await {
                Ok(words) => {
                    self.publish_channel_sample(i, &words, read_started.elapsed());
                }
                Err(err) => {
                    self.metrics.failure_counter(&err).inc();
                    self.publish_channel_failure(i, &err);
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(started.elapsed()),
        }
    }

    /// Next strictly-increasing timestamp for a channel.
    fn stamp(&mut self, channel: u16) -> u64 {
        let now = now_epoch_ms();
        let ts = match self.last_ts.get(&channel) {
            Some(&last) if now <= last => last + 1,
            _ => now,
        };
        self.last_ts.insert(channel, ts);
        ts
    }

    fn publish_channel_sample(&mut self, index: usize, words: &[u16], acquisition: Duration) {
        let ch = self.device.channels[index].clone();
        let timestamp_ms = self.stamp(ch.channel_number);

        let raw = match decode_counter(ch.counter_width, words, ch.word_swap) {
            Ok(raw) => raw,
            Err(e) => {
                if self.decode_error_logged.insert(ch.channel_number) {
                    warn!(
                        device = %self.device.device_id,
                        channel = ch.channel_number,
                        error = %e,
                        "channel cannot be decoded, check register layout"
                    );
                }
                let reading = process_failure(
                    &self.device,
                    &ch,
                    timestamp_ms,
                    Quality::ConfigurationError,
                    &e.to_string(),
                    self.last_good.get(&ch.channel_number).copied(),
                    acquisition,
                );
                self.bus.publish(reading);
                return;
            }
        };

        let rate = self.rate.observe(
            ch.channel_number,
            timestamp_ms,
            raw,
            ch.counter_width,
            ch.rate_window_ms,
        );
        if let (RateOutcome::Rate(r), Some(gauge)) =
            (rate, self.metrics.rate_gauges.get(&ch.channel_number))
        {
            gauge.set(r);
        }

        let sample = RawSample {
            device_id: self.device.device_id.clone(),
            channel: ch.channel_number,
            timestamp_ms,
            raw_value: raw,
            acquisition,
        };
        let reading = process_sample(&self.device, &ch, &sample, rate);
        if let Some(v) = reading.processed_value {
            self.last_good.insert(ch.channel_number, v);
        }
        if !self.bus.publish(reading) {
            debug!(device = %self.device.device_id, "bus full, oldest reading dropped");
        }
    }

    fn publish_channel_failure(&mut self, index: usize, err: &TransportError) {
        let ch = self.device.channels[index].clone();
        let timestamp_ms = self.stamp(ch.channel_number);
        let quality = match err {
            TransportError::Timeout(_) => Quality::Timeout,
            TransportError::ConnectionLost(_) | TransportError::RemoteException(_) => {
                Quality::DeviceFailure
            }
        };
        let reading = process_failure(
            &self.device,
            &ch,
            timestamp_ms,
            quality,
            &err.to_string(),
            self.last_good.get(&ch.channel_number).copied(),
            Duration::ZERO,
        );
        self.bus.publish(reading);
    }
}

/// `min(base · 2ⁿ, poll_interval)` with ±20 % jitter.
fn backoff_with_jitter(n: u32, poll_interval: Duration) -> Duration {
    let exp = n.min(16);
    let nominal = Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(1u64 << exp))
        .min(poll_interval)
        .max(Duration::from_millis(1));
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    nominal.mul_f64(factor)
}
