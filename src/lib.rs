//! Continuous telemetry collector for multi-channel pulse counter devices.
//!
//! The pipeline: per-device poll loops acquire raw counter registers over
//! Modbus TCP, decode and scale them, derive pulse rates over sliding
//! windows, classify quality, and fan the resulting readings into a batching
//! writer that ships them to a downstream time-series store with retry and
//! back-pressure. Health and metrics surfaces observe the same signals.

pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod influx;
pub mod metrics;
pub mod modbus;
pub mod poller;
pub mod process;
pub mod rate;
pub mod reading;
pub mod sink;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{CollectorConfig, DeviceConfig};
use crate::error::CollectorError;
use crate::health::{FleetStatus, HealthRegistry};
use crate::metrics::MetricsRegistry;
use crate::modbus::{ModbusTransport, TcpTransport};
use crate::poller::DevicePoller;
use crate::sink::{BatchWriter, BatchWriterConfig, SinkStatus, TimeSeriesSink};

/// Builds one transport per device at composition time.
pub type TransportFactory =
    Box<dyn Fn(&DeviceConfig, &CollectorConfig) -> Box<dyn ModbusTransport> + Send + Sync>;

/// Cancels the whole pipeline. Clone freely.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The assembled pipeline: configuration, registries and the downstream
/// sink, wired together at startup and driven by [`Collector::run`].
pub struct Collector {
    cfg: CollectorConfig,
    health: HealthRegistry,
    metrics: MetricsRegistry,
    sink: Arc<dyn TimeSeriesSink>,
    transport_factory: TransportFactory,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Collector {
    /// Build with the real Modbus TCP transport.
    pub fn new(cfg: CollectorConfig, sink: Arc<dyn TimeSeriesSink>) -> Result<Self, CollectorError> {
        Self::with_transport_factory(
            cfg,
            sink,
            Box::new(|device, global| {
                Box::new(TcpTransport::new(device, device.poll_interval(global)))
                    as Box<dyn ModbusTransport>
            }),
        )
    }

    /// Build with a custom transport factory (simulation, tests).
    pub fn with_transport_factory(
        cfg: CollectorConfig,
        sink: Arc<dyn TimeSeriesSink>,
        transport_factory: TransportFactory,
    ) -> Result<Self, CollectorError> {
        cfg.validate_global()?;
        let (tx, rx) = watch::channel(false);
        Ok(Collector {
            health: HealthRegistry::new(cfg.warn_threshold, cfg.offline_threshold),
            metrics: MetricsRegistry::new(),
            sink,
            transport_factory,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
            cfg,
        })
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn metrics(&self) -> MetricsRegistry {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Spawn every worker and run until the shutdown handle fires, then
    /// drain: loops first, then the sink's final flush.
    pub async fn run(self) -> Result<(), CollectorError> {
        let (bus_tx, bus_rx) = bus::channel(self.cfg.bus_capacity());

        // sink worker
        let (writer, sink_status) = BatchWriter::new(
            Arc::clone(&self.sink),
            BatchWriterConfig::from_collector(&self.cfg),
            bus_rx,
            &self.metrics,
        );
        let writer_handle = tokio::spawn(writer.run());

        // bus drop counter is owned by the bus; mirror it into the registry
        let bus_dropped = self.metrics.counter(
            "bus_dropped_total",
            "Readings dropped on ingestion back-pressure",
            &[],
        );

        // device loops
        let mut loops = JoinSet::new();
        let mut max_read_timeout = Duration::ZERO;
        let mut started = 0usize;
        for device in self.cfg.devices.clone() {
            if let Err(reason) = device.validate(&self.cfg) {
                error!(device = %device.device_id, %reason, "device rejected, not polling");
                self.health.mark_error(&device.device_id, &reason);
                continue;
            }
            max_read_timeout = max_read_timeout.max(device.read_timeout());
            let transport = (self.transport_factory)(&device, &self.cfg);
            let poller = DevicePoller::new(
                device,
                &self.cfg,
                transport,
                bus_tx.clone(),
                self.health.clone(),
                &self.metrics,
                self.shutdown_rx.clone(),
            );
            loops.spawn(poller.run());
            started += 1;
        }
        info!(
            devices = started,
            rejected = self.cfg.devices.len() - started,
            "collector started"
        );

        // observability endpoints
        let server = web::ObservabilityServer::new(
            self.cfg.http_addr.clone(),
            self.health.clone(),
            sink_status.clone(),
            self.metrics.clone(),
            self.shutdown_rx.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "observability server failed");
            }
        });

        // fleet health emitter
        let emitter = spawn_health_emitter(
            self.health.clone(),
            sink_status,
            self.cfg.health_check_interval(),
            self.shutdown_rx.clone(),
            bus_tx.clone(),
            bus_dropped.clone(),
        );

        // park until cancelled
        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        info!("shutdown requested, draining");

        // loops are allowed to finish their inflight read
        let drain_deadline = max_read_timeout + Duration::from_secs(1);
        if timeout(drain_deadline, async {
            while loops.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("device loops did not stop in time, aborting the rest");
            loops.shutdown().await;
        }

        // keep the scrape-side counter current before the final snapshot
        let dropped = bus_tx.dropped();
        if dropped > bus_dropped.get() {
            bus_dropped.add(dropped - bus_dropped.get());
        }

        // close the bus so the sink drains and runs its final flush
        bus_tx.close();
        let flush_deadline = self.cfg.shutdown_deadline() + Duration::from_secs(1);
        if timeout(flush_deadline, writer_handle).await.is_err() {
            error!("sink did not finish its final flush within the deadline");
        }
        emitter.abort();

        info!("collector stopped");
        Ok(())
    }
}

/// Periodic fleet snapshot: mirrors bus/sink signals into the metrics
/// registry and into logs, warning on status transitions.
fn spawn_health_emitter(
    health: HealthRegistry,
    sink_status: SinkStatus,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    bus: bus::IngestionBus,
    bus_dropped: metrics::Counter,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_status: Option<FleetStatus> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = bus.dropped();
                    if dropped > bus_dropped.get() {
                        bus_dropped.add(dropped - bus_dropped.get());
                    }
                    let snapshot = health.fleet(sink_status.health());
                    if last_status != Some(snapshot.status) {
                        match snapshot.status {
                            FleetStatus::Healthy => info!(
                                online = snapshot.counts.online,
                                "fleet healthy"
                            ),
                            FleetStatus::Degraded => warn!(
                                warning = snapshot.counts.warning,
                                error = snapshot.counts.error,
                                sink = ?snapshot.sink,
                                "fleet degraded"
                            ),
                            FleetStatus::Critical => error!(
                                error = snapshot.counts.error,
                                offline = snapshot.counts.offline,
                                sink = ?snapshot.sink,
                                "fleet critical"
                            ),
                        }
                        last_status = Some(snapshot.status);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
