//! # Stage: Rate Engine
//!
//! ## Responsibility
//! Per-channel sliding window of `(timestamp, raw_value)` samples and the
//! pulses-per-second derivation over it, including counter wrap-around
//! arithmetic for the channel's declared width.
//!
//! ## Guarantees
//! - Bounded: each window holds at most the configured sample count;
//!   a per-channel time cap additionally evicts stale samples
//! - Pure arithmetic: no clocks are read here, timestamps come in with the
//!   samples
//! - Non-panicking: degenerate inputs (single sample, zero or negative time
//!   delta, values beyond the declared width) yield `Insufficient`, never
//!   a bogus rate
//!
//! ## NOT Responsible For
//! - Quality classification (the processor maps outcomes onto qualities)
//! - Scaling to engineering units (the processor)

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::CounterWidth;

/// Hard bounds for [`recommend_window`].
pub const MIN_WINDOW: Duration = Duration::from_secs(10);
pub const MAX_WINDOW: Duration = Duration::from_secs(1800);

/// Result of feeding one sample into a channel window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateOutcome {
    /// Pulses per second over the window span.
    Rate(f64),
    /// Fewer than two samples, or the window span is not positive.
    Insufficient,
    /// The counter moved backwards on a u64 channel, where a wrap cannot be
    /// told apart from a backwards jump.
    Overflow,
}

impl RateOutcome {
    pub fn rate(self) -> Option<f64> {
        match self {
            RateOutcome::Rate(r) => Some(r),
            _ => None,
        }
    }
}

/// Fixed-capacity window of `(timestamp_ms, raw_value)` samples for one
/// channel. Evicts the oldest entry when full.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<(u64, u64)>,
    cap: usize,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        SampleWindow {
            samples: VecDeque::with_capacity(cap.max(2)),
            cap: cap.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Push a sample, evicting the oldest when full and then everything
    /// older than `max_age_ms` relative to the newest sample.
    fn push(&mut self, timestamp_ms: u64, raw: u64, max_age_ms: Option<u64>) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp_ms, raw));
        if let Some(age) = max_age_ms {
            let cutoff = timestamp_ms.saturating_sub(age);
            while let Some(&(t, _)) = self.samples.front() {
                if t < cutoff && self.samples.len() > 1 {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn oldest(&self) -> Option<(u64, u64)> {
        self.samples.front().copied()
    }

    fn newest(&self) -> Option<(u64, u64)> {
        self.samples.back().copied()
    }
}

/// Per-device rate state: one window per channel, owned by the device loop.
pub struct RateEngine {
    default_cap: usize,
    windows: HashMap<u16, SampleWindow>,
}

impl RateEngine {
    pub fn new(default_cap: usize) -> Self {
        RateEngine {
            default_cap: default_cap.max(2),
            windows: HashMap::new(),
        }
    }

    /// Feed one sample and derive the current rate for the channel.
    pub fn observe(
        &mut self,
        channel: u16,
        timestamp_ms: u64,
        raw: u64,
        width: CounterWidth,
        max_age_ms: Option<u64>,
    ) -> RateOutcome {
        let cap = self.default_cap;
        let window = self
            .windows
            .entry(channel)
            .or_insert_with(|| SampleWindow::new(cap));
        window.push(timestamp_ms, raw, max_age_ms);

        if window.len() < 2 {
            return RateOutcome::Insufficient;
        }
        let (t0, v0) = window.oldest().expect("len >= 2");
        let (tk, vk) = window.newest().expect("len >= 2");
        if tk <= t0 {
            return RateOutcome::Insufficient;
        }

        let delta = if vk >= v0 {
            vk - v0
        } else {
            // counter wrapped within the window
            if width == CounterWidth::U64 {
                return RateOutcome::Overflow;
            }
            width.max_value().saturating_sub(v0).saturating_add(vk).saturating_add(1)
        };

        let span_s = (tk - t0) as f64 / 1000.0;
        RateOutcome::Rate(delta as f64 / span_s)
    }

    /// Drop a channel's history (used when a channel is reconfigured away).
    pub fn reset_channel(&mut self, channel: u16) {
        self.windows.remove(&channel);
    }

    pub fn window_len(&self, channel: u16) -> usize {
        self.windows.get(&channel).map_or(0, SampleWindow::len)
    }
}

/// Recommend a rate window for a channel pulsing at `frequency_hz` so that
/// the ±1-pulse counting error stays within `accuracy` (a fraction, e.g.
/// 0.05 for 5 %). Clamped to `[MIN_WINDOW, MAX_WINDOW]`.
pub fn recommend_window(frequency_hz: f64, accuracy: f64) -> Duration {
    if !(frequency_hz > 0.0) || !(accuracy > 0.0) {
        return MAX_WINDOW;
    }
    let seconds = 1.0 / (frequency_hz * accuracy);
    let clamped = seconds.clamp(MIN_WINDOW.as_secs_f64(), MAX_WINDOW.as_secs_f64());
    Duration::from_secs_f64(clamped)
}
