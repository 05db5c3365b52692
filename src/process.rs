//! Reading assembly: scaling, range validation, quality classification and
//! tag merging.
//!
//! Pure and stateless — the device loop supplies the per-channel carry-over
//! state (last good value) explicitly.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{ChannelConfig, DeviceConfig};
use crate::rate::RateOutcome;
use crate::reading::{Quality, RawSample, Reading};

/// Merged tag set for a channel. Precedence on key collision, later wins:
/// pipeline tags (`device_id`, `channel`) < device static tags < channel
/// static tags.
pub fn merge_tags(device: &DeviceConfig, channel: &ChannelConfig) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("device_id".to_string(), device.device_id.clone());
    tags.insert("channel".to_string(), channel.channel_number.to_string());
    for (k, v) in &device.tags {
        tags.insert(k.clone(), v.clone());
    }
    for (k, v) in &channel.tags {
        tags.insert(k.clone(), v.clone());
    }
    tags
}

/// Build the published reading for a successfully acquired sample.
pub fn process_sample(
    device: &DeviceConfig,
    channel: &ChannelConfig,
    sample: &RawSample,
    rate: RateOutcome,
) -> Reading {
    let processed = sample.raw_value as f64 * channel.scale_factor + channel.offset;

    let out_of_range = channel.min_valid.is_some_and(|lo| processed < lo)
        || channel.max_valid.is_some_and(|hi| processed > hi);

    let quality = match rate {
        RateOutcome::Overflow => Quality::Overflow,
        _ if out_of_range => Quality::Uncertain,
        RateOutcome::Insufficient => Quality::Uncertain,
        RateOutcome::Rate(_) => Quality::Good,
    };

    Reading {
        device_id: sample.device_id.clone(),
        channel: sample.channel,
        timestamp_ms: sample.timestamp_ms,
        raw_value: sample.raw_value,
        processed_value: Some(processed),
        rate: rate.rate(),
        unit: channel.unit.clone(),
        quality,
        tags: merge_tags(device, channel),
        acquisition_ms: sample.acquisition.as_millis() as u64,
        error: None,
    }
}

/// Build the published reading for a failed acquisition. The last good
/// processed value is carried over when one exists.
#[allow(clippy::too_many_arguments)]
pub fn process_failure(
    device: &DeviceConfig,
    channel: &ChannelConfig,
    timestamp_ms: u64,
    quality: Quality,
    error: &str,
    last_good: Option<f64>,
    acquisition: Duration,
) -> Reading {
    Reading {
        device_id: device.device_id.clone(),
        channel: channel.channel_number,
        timestamp_ms,
        raw_value: 0,
        processed_value: last_good,
        rate: None,
        unit: channel.unit.clone(),
        quality,
        tags: merge_tags(device, channel),
        acquisition_ms: acquisition.as_millis() as u64,
        error: Some(error.to_string()),
    }
}
