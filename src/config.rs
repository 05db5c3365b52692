//! Device and channel configuration.
//!
//! Configuration is loaded once at startup from a TOML file, validated, and
//! immutable afterwards. A device that fails validation is rejected on its
//! own — the rest of the fleet still runs.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CollectorError;

/// Floor for per-device poll intervals.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

// --- serde default functions -----------------------------------------------

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_batch_size() -> usize { 100 }
fn default_flush_interval_ms() -> u64 { 5000 }
fn default_max_retries() -> u32 { 3 }
fn default_rate_window_samples() -> usize { 10 }
fn default_warn_threshold() -> u32 { 3 }
fn default_offline_threshold() -> u32 { 10 }
fn default_shutdown_deadline_ms() -> u64 { 30_000 }
fn default_http_addr() -> String { "127.0.0.1:9464".to_string() }
fn default_port() -> u16 { 502 }
fn default_read_timeout_ms() -> u64 { 3000 }
fn default_influx_timeout_ms() -> u64 { 5000 }
fn default_keep_alive() -> bool { true }
fn default_scale_factor() -> f64 { 1.0 }
fn default_enabled() -> bool { true }

/// Bit-width of the physical counter on the device. Determines both the
/// number of holding registers a channel occupies and its wrap-around
/// arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterWidth {
    U16,
    U32,
    U64,
}

impl CounterWidth {
    /// Highest representable counter value for this width.
    pub fn max_value(self) -> u64 {
        match self {
            CounterWidth::U16 => u64::from(u16::MAX),
            CounterWidth::U32 => u64::from(u32::MAX),
            CounterWidth::U64 => u64::MAX,
        }
    }

    /// Number of 16-bit holding registers a counter of this width occupies.
    pub fn register_count(self) -> u16 {
        match self {
            CounterWidth::U16 => 1,
            CounterWidth::U32 => 2,
            CounterWidth::U64 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CounterWidth::U16 => "u16",
            CounterWidth::U32 => "u32",
            CounterWidth::U64 => "u64",
        }
    }
}

/// One counter channel on a device.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub channel_number: u16,
    pub start_register: u16,
    /// Must agree with `counter_width` (u16→1, u32→2, u64→4).
    pub register_count: u16,
    pub counter_width: CounterWidth,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min_valid: Option<f64>,
    #[serde(default)]
    pub max_valid: Option<f64>,
    /// Static tags attached to every reading from this channel. Override
    /// device tags and pipeline tags on key collision.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Optional recency cap for the rate window, see the rate engine.
    #[serde(default)]
    pub rate_window_ms: Option<u64>,
    /// Reverse word order for devices that transmit low word first.
    #[serde(default)]
    pub word_swap: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ChannelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.register_count != self.counter_width.register_count() {
            return Err(format!(
                "channel {}: register_count {} does not match counter_width {} (expected {})",
                self.channel_number,
                self.register_count,
                self.counter_width.as_str(),
                self.counter_width.register_count()
            ));
        }
        if !self.scale_factor.is_finite() || self.scale_factor == 0.0 {
            return Err(format!(
                "channel {}: scale_factor must be finite and non-zero",
                self.channel_number
            ));
        }
        if !self.offset.is_finite() {
            return Err(format!("channel {}: offset must be finite", self.channel_number));
        }
        if let (Some(lo), Some(hi)) = (self.min_valid, self.max_valid) {
            if lo > hi {
                return Err(format!(
                    "channel {}: min_valid {} exceeds max_valid {}",
                    self.channel_number, lo, hi
                ));
            }
        }
        Ok(())
    }
}

/// One polled device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub unit_id: u8,
    /// Overrides the global poll interval when set.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Overrides the global retry ceiling when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Static tags attached to every reading from this device.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl DeviceConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Effective poll interval, falling back to the global default.
    pub fn poll_interval(&self, global: &CollectorConfig) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(global.poll_interval_ms))
    }

    /// Effective retry ceiling, falling back to the global default.
    pub fn max_retries(&self, global: &CollectorConfig) -> u32 {
        self.max_retries.unwrap_or(global.max_retries)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Full per-device validation. An error here rejects only this device.
    pub fn validate(&self, global: &CollectorConfig) -> Result<(), String> {
        if self.device_id.trim().is_empty() {
            return Err("device_id must be non-empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err(format!("device {}: host must be non-empty", self.device_id));
        }
        if self.unit_id == 0 {
            return Err(format!("device {}: unit_id must be 1..=255", self.device_id));
        }
        let interval = self.poll_interval_ms.unwrap_or(global.poll_interval_ms);
        if interval < MIN_POLL_INTERVAL_MS {
            return Err(format!(
                "device {}: poll_interval_ms {} below minimum {}",
                self.device_id, interval, MIN_POLL_INTERVAL_MS
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(format!("device {}: read_timeout_ms must be > 0", self.device_id));
        }

        let mut seen = HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.channel_number) {
                return Err(format!(
                    "device {}: duplicate channel_number {}",
                    self.device_id, ch.channel_number
                ));
            }
            ch.validate()
                .map_err(|e| format!("device {}: {}", self.device_id, e))?;
        }
        if self.enabled_channels().next().is_none() {
            return Err(format!(
                "device {}: at least one channel must be enabled",
                self.device_id
            ));
        }
        Ok(())
    }
}

/// Optional downstream InfluxDB endpoint. When absent the collector logs
/// batches instead of shipping them.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    #[serde(default = "default_influx_timeout_ms")]
    pub timeout_ms: u64,
}

/// Top-level collector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rate_window_samples")]
    pub rate_window_samples: usize,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u32,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
    /// Bind address for the /health and /metrics endpoints.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default)]
    pub influx: Option<InfluxConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            poll_interval_ms: default_poll_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            rate_window_samples: default_rate_window_samples(),
            warn_threshold: default_warn_threshold(),
            offline_threshold: default_offline_threshold(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            http_addr: default_http_addr(),
            influx: None,
            devices: Vec::new(),
        }
    }
}

impl CollectorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CollectorError> {
        let cfg: CollectorConfig =
            toml::from_str(s).map_err(|e| CollectorError::Config(e.to_string()))?;
        cfg.validate_global()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CollectorError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// Ingestion bus capacity.
    pub fn bus_capacity(&self) -> usize {
        self.batch_size.saturating_mul(4).max(4)
    }

    /// Fleet-wide invariants. Per-device problems are *not* checked here —
    /// they reject individual devices at startup instead.
    pub fn validate_global(&self) -> Result<(), CollectorError> {
        if self.batch_size == 0 {
            return Err(CollectorError::Config("batch_size must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(CollectorError::Config("flush_interval_ms must be > 0".into()));
        }
        if self.rate_window_samples < 2 {
            return Err(CollectorError::Config(
                "rate_window_samples must be at least 2".into(),
            ));
        }
        if self.warn_threshold == 0 || self.offline_threshold <= self.warn_threshold {
            return Err(CollectorError::Config(
                "thresholds must satisfy 0 < warn_threshold < offline_threshold".into(),
            ));
        }
        let mut ids = HashSet::new();
        for dev in &self.devices {
            if !ids.insert(dev.device_id.as_str()) {
                return Err(CollectorError::Config(format!(
                    "duplicate device_id {:?}",
                    dev.device_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(n: u16) -> ChannelConfig {
        ChannelConfig {
            channel_number: n,
            start_register: n * 2,
            register_count: 2,
            counter_width: CounterWidth::U32,
            scale_factor: 1.0,
            offset: 0.0,
            unit: "pulses".into(),
            min_valid: None,
            max_valid: None,
            tags: BTreeMap::new(),
            rate_window_ms: None,
            word_swap: false,
            enabled: true,
        }
    }

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig {
            device_id: id.into(),
            host: "10.0.0.10".into(),
            port: 502,
            unit_id: 1,
            poll_interval_ms: None,
            read_timeout_ms: 3000,
            max_retries: None,
            keep_alive: true,
            tags: BTreeMap::new(),
            channels: vec![channel(0)],
        }
    }

    // ===== CounterWidth =====

    #[test]
    fn test_width_max_values() {
        assert_eq!(CounterWidth::U16.max_value(), 65_535);
        assert_eq!(CounterWidth::U32.max_value(), 4_294_967_295);
        assert_eq!(CounterWidth::U64.max_value(), u64::MAX);
    }

    #[test]
    fn test_width_register_counts() {
        assert_eq!(CounterWidth::U16.register_count(), 1);
        assert_eq!(CounterWidth::U32.register_count(), 2);
        assert_eq!(CounterWidth::U64.register_count(), 4);
    }

    // ===== channel validation =====

    #[test]
    fn test_channel_width_register_mismatch_rejected() {
        let mut ch = channel(0);
        ch.register_count = 1; // u32 needs 2
        assert!(ch.validate().is_err());
    }

    #[test]
    fn test_channel_zero_scale_rejected() {
        let mut ch = channel(0);
        ch.scale_factor = 0.0;
        assert!(ch.validate().is_err());
    }

    #[test]
    fn test_channel_nan_scale_rejected() {
        let mut ch = channel(0);
        ch.scale_factor = f64::NAN;
        assert!(ch.validate().is_err());
    }

    #[test]
    fn test_channel_inverted_valid_range_rejected() {
        let mut ch = channel(0);
        ch.min_valid = Some(10.0);
        ch.max_valid = Some(1.0);
        assert!(ch.validate().is_err());
    }

    // ===== device validation =====

    #[test]
    fn test_device_valid() {
        let global = CollectorConfig::default();
        assert!(device("a").validate(&global).is_ok());
    }

    #[test]
    fn test_device_empty_id_rejected() {
        let global = CollectorConfig::default();
        assert!(device("  ").validate(&global).is_err());
    }

    #[test]
    fn test_device_zero_unit_id_rejected() {
        let global = CollectorConfig::default();
        let mut d = device("a");
        d.unit_id = 0;
        assert!(d.validate(&global).is_err());
    }

    #[test]
    fn test_device_poll_interval_below_floor_rejected() {
        let global = CollectorConfig::default();
        let mut d = device("a");
        d.poll_interval_ms = Some(MIN_POLL_INTERVAL_MS - 1);
        assert!(d.validate(&global).is_err());
    }

    #[test]
    fn test_device_duplicate_channel_rejected() {
        let global = CollectorConfig::default();
        let mut d = device("a");
        d.channels.push(channel(0));
        assert!(d.validate(&global).is_err());
    }

    #[test]
    fn test_device_all_channels_disabled_rejected() {
        let global = CollectorConfig::default();
        let mut d = device("a");
        d.channels[0].enabled = false;
        assert!(d.validate(&global).is_err());
    }

    #[test]
    fn test_device_effective_overrides() {
        let global = CollectorConfig::default();
        let mut d = device("a");
        assert_eq!(d.poll_interval(&global), Duration::from_millis(1000));
        assert_eq!(d.max_retries(&global), 3);
        d.poll_interval_ms = Some(250);
        d.max_retries = Some(7);
        assert_eq!(d.poll_interval(&global), Duration::from_millis(250));
        assert_eq!(d.max_retries(&global), 7);
    }

    // ===== global validation =====

    #[test]
    fn test_global_duplicate_device_ids_rejected() {
        let mut cfg = CollectorConfig::default();
        cfg.devices = vec![device("a"), device("a")];
        assert!(cfg.validate_global().is_err());
    }

    #[test]
    fn test_global_threshold_ordering_enforced() {
        let mut cfg = CollectorConfig::default();
        cfg.warn_threshold = 10;
        cfg.offline_threshold = 10;
        assert!(cfg.validate_global().is_err());
    }

    #[test]
    fn test_bus_capacity_is_four_batches() {
        let cfg = CollectorConfig::default();
        assert_eq!(cfg.bus_capacity(), 400);
    }

    // ===== TOML parsing =====

    #[test]
    fn test_from_toml_minimal_defaults() {
        let cfg = CollectorConfig::from_toml_str("").expect("parse");
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.flush_interval_ms, 5000);
        assert_eq!(cfg.rate_window_samples, 10);
        assert_eq!(cfg.warn_threshold, 3);
        assert_eq!(cfg.offline_threshold, 10);
        assert!(cfg.devices.is_empty());
        assert!(cfg.influx.is_none());
    }

    #[test]
    fn test_from_toml_full_device() {
        let toml = r#"
            poll_interval_ms = 500

            [[devices]]
            device_id = "line-a"
            host = "192.168.1.20"
            unit_id = 3

            [[devices.channels]]
            channel_number = 0
            start_register = 16
            register_count = 2
            counter_width = "u32"
            scale_factor = 0.5
            unit = "bottles"

            [devices.channels.tags]
            line = "A"
        "#;
        let cfg = CollectorConfig::from_toml_str(toml).expect("parse");
        assert_eq!(cfg.devices.len(), 1);
        let d = &cfg.devices[0];
        assert_eq!(d.port, 502);
        assert_eq!(d.read_timeout_ms, 3000);
        assert!(d.keep_alive);
        let ch = &d.channels[0];
        assert_eq!(ch.counter_width, CounterWidth::U32);
        assert_eq!(ch.scale_factor, 0.5);
        assert_eq!(ch.tags["line"], "A");
        assert!(ch.enabled);
        assert!(d.validate(&cfg).is_ok());
    }

    #[test]
    fn test_from_toml_bad_width_rejected() {
        let toml = r#"
            [[devices]]
            device_id = "x"
            host = "h"
            unit_id = 1

            [[devices.channels]]
            channel_number = 0
            start_register = 0
            register_count = 2
            counter_width = "u24"
        "#;
        assert!(CollectorConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(
            &mut file,
            b"poll_interval_ms = 250\nbatch_size = 10\n",
        )
        .expect("write");
        let cfg = CollectorConfig::load(file.path()).expect("load");
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.batch_size, 10);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = CollectorConfig::load("/nonexistent/collector.toml").unwrap_err();
        assert!(matches!(err, CollectorError::Io(_)));
    }

    #[test]
    fn test_from_toml_influx_section() {
        let toml = r#"
            [influx]
            url = "http://influx:8086"
            org = "plant"
            bucket = "counters"
            token = "secret"
        "#;
        let cfg = CollectorConfig::from_toml_str(toml).expect("parse");
        let influx = cfg.influx.expect("influx");
        assert_eq!(influx.bucket, "counters");
        assert_eq!(influx.timeout_ms, 5000);
    }
}
