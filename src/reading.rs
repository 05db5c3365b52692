//! Pipeline data model: raw samples, published readings, and data quality.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// Classification of a reading's trustworthiness, independent of its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Value read, decoded, scaled and within range with a usable rate.
    Good,
    /// Value present but suspect: out of the configured valid range, or the
    /// rate is undefined for lack of history.
    Uncertain,
    /// Value is known to be unusable.
    Bad,
    /// The read exceeded the device's read timeout.
    Timeout,
    /// The device or its connection failed mid-request.
    DeviceFailure,
    /// The channel layout cannot produce a valid value (width/register
    /// mismatch or rejected configuration).
    ConfigurationError,
    /// The rate engine saw a counter wrap it cannot resolve.
    Overflow,
    Unknown,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good               => "good",
            Quality::Uncertain          => "uncertain",
            Quality::Bad                => "bad",
            Quality::Timeout            => "timeout",
            Quality::DeviceFailure      => "device_failure",
            Quality::ConfigurationError => "configuration_error",
            Quality::Overflow           => "overflow",
            Quality::Unknown            => "unknown",
        }
    }

    /// `true` for qualities that represent an acquired value rather than an
    /// acquisition failure.
    pub fn is_acquired(self) -> bool {
        matches!(self, Quality::Good | Quality::Uncertain | Quality::Overflow)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw acquisition from a device channel, before processing.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub device_id: String,
    pub channel: u16,
    /// Wall-clock capture time, milliseconds since the Unix epoch. Strictly
    /// increasing per `(device_id, channel)` — the loop clamps to `last + 1`.
    pub timestamp_ms: u64,
    pub raw_value: u64,
    /// Time the transport spent acquiring this sample.
    pub acquisition: Duration,
}

/// The pipeline's published record, carried from the device loops through the
/// ingestion bus into the batching sink.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub channel: u16,
    pub timestamp_ms: u64,
    pub raw_value: u64,
    /// Engineering-unit value (`raw · scale + offset`). `None` when the
    /// acquisition failed and no previous good value exists to carry over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_value: Option<f64>,
    /// First derivative in pulses per second, `None` when undefined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    pub unit: String,
    pub quality: Quality,
    /// Channel tags over device tags over pipeline tags (`device_id`,
    /// `channel`); BTreeMap so iteration order is deterministic.
    pub tags: BTreeMap<String, String>,
    pub acquisition_ms: u64,
    /// Human-readable acquisition error, present on failure qualities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reading {
    /// Sample identity used by downstream stores for duplicate suppression.
    pub fn identity(&self) -> (&str, u16, u64) {
        (&self.device_id, self.channel, self.timestamp_ms)
    }
}
