//! InfluxDB v2 sink adapter.
//!
//! Serializes batches as line protocol and POSTs them to `/api/v2/write`
//! with millisecond precision. HTTP status classes map onto the sink error
//! taxonomy: 4xx is permanent (the payload will never be accepted), 5xx and
//! network-level failures are transient. Duplicate suppression on retry is
//! free here: identical measurement+tagset+timestamp lines upsert.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::InfluxConfig;
use crate::error::SinkError;
use crate::reading::Reading;
use crate::sink::TimeSeriesSink;

const MEASUREMENT: &str = "pulse_counter";

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
}

impl InfluxSink {
    pub fn new(cfg: &InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| SinkError::Permanent(format!("http client: {e}")))?;
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            cfg.url.trim_end_matches('/'),
            cfg.org,
            cfg.bucket
        );
        Ok(InfluxSink {
            client,
            write_url,
            token: cfg.token.clone(),
        })
    }

    fn render_batch(batch: &[Reading]) -> String {
        let mut body = String::with_capacity(batch.len() * 128);
        for reading in batch {
            render_line(&mut body, reading);
        }
        body
    }
}

/// Escape a tag key or tag value (commas, equals, spaces).
fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Escape a string field value (backslashes and double quotes).
fn escape_field_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_line(out: &mut String, reading: &Reading) {
    out.push_str(MEASUREMENT);
    // reading.tags already contains device_id and channel; BTreeMap order
    // keeps the tagset stable so retries upsert instead of duplicating
    for (k, v) in &reading.tags {
        out.push(',');
        out.push_str(&escape_tag(k));
        out.push('=');
        out.push_str(&escape_tag(v));
    }
    out.push_str(",quality=");
    out.push_str(reading.quality.as_str());

    out.push_str(&format!(" raw={}u", reading.raw_value));
    if let Some(v) = reading.processed_value {
        if v.is_finite() {
            out.push_str(&format!(",value={v}"));
        }
    }
    if let Some(r) = reading.rate {
        if r.is_finite() {
            out.push_str(&format!(",rate={r}"));
        }
    }
    out.push_str(&format!(",acquisition_ms={}u", reading.acquisition_ms));
    if !reading.unit.is_empty() {
        out.push_str(&format!(",unit=\"{}\"", escape_field_str(&reading.unit)));
    }

    out.push_str(&format!(" {}\n", reading.timestamp_ms));
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write_batch(&self, batch: &[Reading]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = Self::render_batch(batch);
        let response = self
            .client
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("influx write: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(lines = batch.len(), "influx batch written");
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(SinkError::Permanent(format!("influx {status}: {detail}")))
        } else {
            Err(SinkError::Transient(format!("influx {status}: {detail}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::reading::Quality;

    fn reading() -> Reading {
        let mut tags = BTreeMap::new();
        tags.insert("channel".to_string(), "0".to_string());
        tags.insert("device_id".to_string(), "line a".to_string());
        Reading {
            device_id: "line a".into(),
            channel: 0,
            timestamp_ms: 1_700_000_000_123,
            raw_value: 42,
            processed_value: Some(21.5),
            rate: Some(3.25),
            unit: "bottles".into(),
            quality: Quality::Good,
            tags,
            acquisition_ms: 9,
            error: None,
        }
    }

    #[test]
    fn test_line_contains_measurement_tags_fields_timestamp() {
        let mut out = String::new();
        render_line(&mut out, &reading());
        assert_eq!(
            out,
            "pulse_counter,channel=0,device_id=line\\ a,quality=good \
             raw=42u,value=21.5,rate=3.25,acquisition_ms=9u,unit=\"bottles\" \
             1700000000123\n"
        );
    }

    #[test]
    fn test_line_omits_missing_value_and_rate() {
        let mut r = reading();
        r.processed_value = None;
        r.rate = None;
        r.unit = String::new();
        let mut out = String::new();
        render_line(&mut out, &r);
        assert!(!out.contains("value="));
        assert!(!out.contains("rate="));
        assert!(!out.contains("unit="));
        assert!(out.contains("raw=42u"));
    }

    #[test]
    fn test_tag_escaping() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }

    #[test]
    fn test_field_string_escaping() {
        assert_eq!(escape_field_str("say \"hi\""), "say \\\"hi\\\"");
    }

    #[test]
    fn test_nonfinite_values_skipped() {
        let mut r = reading();
        r.processed_value = Some(f64::NAN);
        r.rate = Some(f64::INFINITY);
        let mut out = String::new();
        render_line(&mut out, &r);
        assert!(!out.contains("value="));
        assert!(!out.contains("rate="));
    }

    #[test]
    fn test_batch_renders_one_line_per_reading() {
        let body = InfluxSink::render_batch(&[reading(), reading()]);
        assert_eq!(body.lines().count(), 2);
    }

    #[test]
    fn test_write_url_shape() {
        let sink = InfluxSink::new(&InfluxConfig {
            url: "http://influx:8086/".into(),
            org: "plant".into(),
            bucket: "counters".into(),
            token: "t".into(),
            timeout_ms: 5000,
        })
        .expect("sink");
        assert_eq!(
            sink.write_url,
            "http://influx:8086/api/v2/write?org=plant&bucket=counters&precision=ms"
        );
    }
}
