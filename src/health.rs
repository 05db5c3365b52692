//! # Stage: Health Aggregator
//!
//! ## Responsibility
//! Per-device health accounting (single writer: the owning device loop) and
//! the fleet-wide snapshot served on `/health`.
//!
//! ## Guarantees
//! - Single-writer discipline: only the owning loop mutates a device entry;
//!   every mutation happens under one lock acquisition, so readers always
//!   see a consistent record
//! - `0 ≤ successful_reads ≤ total_reads`, `success_rate ∈ [0, 100]`
//! - Snapshots are plain values — observers pull at their own cadence and
//!   never couple to the loops' lifecycles
//!
//! ## NOT Responsible For
//! - Serving HTTP (src/web.rs)
//! - Sink health itself (the batch writer owns it; the fleet snapshot only
//!   folds it in)

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::sink::SinkHealth;

/// Per-device status, derived from consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Warning,
    Error,
    Offline,
    Unknown,
}

/// Overall fleet status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One device's health record.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub status: DeviceStatus,
    /// Milliseconds since the Unix epoch of the last successful poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<u64>,
    pub consecutive_failures: u32,
    /// Acquisition latency of the last successful poll, milliseconds.
    pub communication_latency_ms: u64,
    pub total_reads: u64,
    pub successful_reads: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeviceHealth {
    fn new(device_id: &str) -> Self {
        DeviceHealth {
            device_id: device_id.to_string(),
            status: DeviceStatus::Unknown,
            last_success_at: None,
            consecutive_failures: 0,
            communication_latency_ms: 0,
            total_reads: 0,
            successful_reads: 0,
            last_error: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64 * 100.0
        }
    }
}

/// Device state counts in a fleet snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FleetCounts {
    pub online: usize,
    pub warning: usize,
    pub error: usize,
    pub offline: usize,
    pub unknown: usize,
}

/// Point-in-time view of the whole fleet, served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub status: FleetStatus,
    pub counts: FleetCounts,
    pub sink: SinkHealth,
    /// Aggregate success rate across all devices, percent.
    pub success_rate: f64,
    pub uptime_seconds: u64,
    pub devices: Vec<DeviceHealth>,
}

struct RegistryState {
    devices: RwLock<BTreeMap<String, DeviceHealth>>,
    warn_threshold: u32,
    offline_threshold: u32,
    started_at: Instant,
}

/// Health registry. Clone freely — all clones share the same state.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RegistryState>,
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HealthRegistry {
    pub fn new(warn_threshold: u32, offline_threshold: u32) -> Self {
        HealthRegistry {
            inner: Arc::new(RegistryState {
                devices: RwLock::new(BTreeMap::new()),
                warn_threshold,
                offline_threshold,
                started_at: Instant::now(),
            }),
        }
    }

    /// Add a device in `Unknown` state. Idempotent.
    pub fn register(&self, device_id: &str) {
        let mut devices = self.inner.devices.write().expect("health lock poisoned");
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id));
    }

    /// One successful poll: counters, latency and status in a single
    /// critical section.
    pub fn record_success(&self, device_id: &str, latency: std::time::Duration) {
        let mut devices = self.inner.devices.write().expect("health lock poisoned");
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id));
        entry.total_reads += 1;
        entry.successful_reads += 1;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(now_epoch_ms());
        entry.communication_latency_ms = latency.as_millis() as u64;
        entry.status = DeviceStatus::Online;
    }

    /// One failed poll. Returns the new consecutive failure count so the
    /// loop can derive its backoff step.
    pub fn record_failure(&self, device_id: &str, error: &str) -> u32 {
        let warn = self.inner.warn_threshold;
        let offline = self.inner.offline_threshold;
        let mut devices = self.inner.devices.write().expect("health lock poisoned");
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id));
        entry.total_reads += 1;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error.to_string());
        entry.status = if entry.consecutive_failures < warn {
            DeviceStatus::Warning
        } else if entry.consecutive_failures < offline {
            DeviceStatus::Error
        } else {
            DeviceStatus::Offline
        };
        entry.consecutive_failures
    }

    /// Permanently mark a device that failed validation or whose loop died.
    pub fn mark_error(&self, device_id: &str, error: &str) {
        let mut devices = self.inner.devices.write().expect("health lock poisoned");
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id));
        entry.status = DeviceStatus::Error;
        entry.last_error = Some(error.to_string());
    }

    pub fn mark_offline(&self, device_id: &str, error: &str) {
        let mut devices = self.inner.devices.write().expect("health lock poisoned");
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id));
        entry.status = DeviceStatus::Offline;
        entry.last_error = Some(error.to_string());
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceHealth> {
        self.inner
            .devices
            .read()
            .expect("health lock poisoned")
            .get(device_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceHealth> {
        self.inner
            .devices
            .read()
            .expect("health lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Fold the per-device records and the sink's health into the fleet
    /// snapshot.
    pub fn fleet(&self, sink: SinkHealth) -> FleetSnapshot {
        let devices = self.snapshot();
        let mut counts = FleetCounts::default();
        let mut total = 0u64;
        let mut successful = 0u64;
        for d in &devices {
            match d.status {
                DeviceStatus::Online  => counts.online += 1,
                DeviceStatus::Warning => counts.warning += 1,
                DeviceStatus::Error   => counts.error += 1,
                DeviceStatus::Offline => counts.offline += 1,
                DeviceStatus::Unknown => counts.unknown += 1,
            }
            total += d.total_reads;
            successful += d.successful_reads;
        }

        let fleet_size = devices.len();
        let error_offline = counts.error + counts.offline;
        let status = if sink == SinkHealth::Healthy && error_offline == 0 {
            FleetStatus::Healthy
        } else if sink == SinkHealth::Failed
            || (error_offline > 0 && error_offline * 2 >= fleet_size.max(1))
        {
            FleetStatus::Critical
        } else {
            FleetStatus::Degraded
        };

        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64 * 100.0
        };

        FleetSnapshot {
            status,
            counts,
            sink,
            success_rate,
            uptime_seconds: self.uptime_seconds(),
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> HealthRegistry {
        HealthRegistry::new(3, 10)
    }

    // ===== per-device accounting =====

    #[test]
    fn test_register_starts_unknown() {
        let reg = registry();
        reg.register("a");
        let d = reg.device("a").expect("device");
        assert_eq!(d.status, DeviceStatus::Unknown);
        assert_eq!(d.total_reads, 0);
        assert_eq!(d.success_rate(), 0.0);
    }

    #[test]
    fn test_success_resets_failures_and_sets_online() {
        let reg = registry();
        reg.record_failure("a", "x");
        reg.record_failure("a", "x");
        reg.record_success("a", Duration::from_millis(12));
        let d = reg.device("a").expect("device");
        assert_eq!(d.status, DeviceStatus::Online);
        assert_eq!(d.consecutive_failures, 0);
        assert_eq!(d.total_reads, 3);
        assert_eq!(d.successful_reads, 1);
        assert_eq!(d.communication_latency_ms, 12);
        assert!(d.last_success_at.is_some());
    }

    #[test]
    fn test_status_thresholds_warning_error_offline() {
        let reg = registry();
        for i in 1..=12u32 {
            reg.record_failure("a", "timeout");
            let d = reg.device("a").expect("device");
            let expected = if i < 3 {
                DeviceStatus::Warning
            } else if i < 10 {
                DeviceStatus::Error
            } else {
                DeviceStatus::Offline
            };
            assert_eq!(d.status, expected, "after {i} failures");
        }
    }

    #[test]
    fn test_success_rate_bounds() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        reg.record_failure("a", "x");
        let d = reg.device("a").expect("device");
        assert!(d.successful_reads <= d.total_reads);
        let rate = d.success_rate();
        assert!((0.0..=100.0).contains(&rate));
        assert_eq!(rate, 50.0);
    }

    #[test]
    fn test_mark_error_sticky_record() {
        let reg = registry();
        reg.mark_error("bad", "register_count mismatch");
        let d = reg.device("bad").expect("device");
        assert_eq!(d.status, DeviceStatus::Error);
        assert_eq!(d.last_error.as_deref(), Some("register_count mismatch"));
    }

    // ===== fleet snapshot =====

    #[test]
    fn test_fleet_healthy_when_all_online_and_sink_healthy() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        reg.record_success("b", Duration::ZERO);
        let snap = reg.fleet(SinkHealth::Healthy);
        assert_eq!(snap.status, FleetStatus::Healthy);
        assert_eq!(snap.counts.online, 2);
        assert_eq!(snap.success_rate, 100.0);
    }

    #[test]
    fn test_fleet_healthy_tolerates_warnings() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        reg.record_failure("b", "x"); // Warning
        let snap = reg.fleet(SinkHealth::Healthy);
        assert_eq!(snap.status, FleetStatus::Healthy);
    }

    #[test]
    fn test_fleet_degraded_on_sink_degraded() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        let snap = reg.fleet(SinkHealth::Degraded);
        assert_eq!(snap.status, FleetStatus::Degraded);
    }

    #[test]
    fn test_fleet_degraded_on_minority_errors() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        reg.record_success("b", Duration::ZERO);
        reg.record_success("c", Duration::ZERO);
        for _ in 0..5 {
            reg.record_failure("d", "x"); // Error, 1 of 4 devices
        }
        let snap = reg.fleet(SinkHealth::Healthy);
        assert_eq!(snap.status, FleetStatus::Degraded);
    }

    #[test]
    fn test_fleet_critical_on_majority_offline() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        for _ in 0..10 {
            reg.record_failure("b", "x"); // Offline
        }
        let snap = reg.fleet(SinkHealth::Healthy);
        // 1 of 2 devices offline → 50 % → critical
        assert_eq!(snap.status, FleetStatus::Critical);
    }

    #[test]
    fn test_fleet_critical_on_sink_failed() {
        let reg = registry();
        reg.record_success("a", Duration::ZERO);
        let snap = reg.fleet(SinkHealth::Failed);
        assert_eq!(snap.status, FleetStatus::Critical);
    }

    #[test]
    fn test_fleet_empty_is_healthy_with_healthy_sink() {
        let reg = registry();
        let snap = reg.fleet(SinkHealth::Healthy);
        assert_eq!(snap.status, FleetStatus::Healthy);
        assert_eq!(snap.success_rate, 0.0);
    }

    #[test]
    fn test_fleet_snapshot_serializes() {
        let reg = registry();
        reg.record_success("a", Duration::from_millis(5));
        let snap = reg.fleet(SinkHealth::Healthy);
        let json = serde_json::to_string(&snap).expect("serialize");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"device_id\":\"a\""));
        assert!(json.contains("\"sink\":\"healthy\""));
    }
}
