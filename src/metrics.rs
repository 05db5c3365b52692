//! # Stage: Metrics Registry
//!
//! ## Responsibility
//! Process-wide registry of counters, gauges and histograms, handed
//! explicitly to every component (no global singleton). Hot-path updates go
//! through pre-registered handles backed by atomics; the scrape path renders
//! a text exposition of the whole registry.
//!
//! ## Guarantees
//! - Lock-free increments: handles touch only their own `AtomicU64`s
//! - Registration is idempotent: the same name+labels returns the same series
//! - Deterministic render order (BTreeMap keyed families and series)
//!
//! ## NOT Responsible For
//! - Serving the scrape endpoint (src/web.rs)
//! - Deciding what to measure (the loops and the sink register their own)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;

/// Default histogram bucket bounds in seconds, tuned for acquisition and
/// flush latencies (1 ms .. 30 s).
pub static LATENCY_BUCKETS: Lazy<Vec<f64>> = Lazy::new(|| {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter   => "counter",
            MetricKind::Gauge     => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Monotonic counter handle.
#[derive(Clone)]
pub struct Counter {
    cell: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self) {
        self.cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.cell.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Last-value gauge handle (f64 stored as bits).
#[derive(Clone)]
pub struct Gauge {
    bits: Arc<AtomicU64>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

struct HistogramCore {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

/// Cumulative histogram handle.
#[derive(Clone)]
pub struct Histogram {
    core: Arc<HistogramCore>,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        for (i, bound) in self.core.bounds.iter().enumerate() {
            if value <= *bound {
                self.core.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.core.count.fetch_add(1, Ordering::Relaxed);
        // f64 accumulate via CAS loop
        let mut current = self.core.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.core.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.core.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.core.sum_bits.load(Ordering::Relaxed))
    }
}

enum Series {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicU64>),
    Histogram(Arc<HistogramCore>),
}

struct Family {
    help: &'static str,
    kind: MetricKind,
    series: BTreeMap<String, Series>,
}

struct RegistryState {
    families: Mutex<BTreeMap<&'static str, Family>>,
    started_at: Instant,
}

/// The registry. Clone freely — all clones share the same state.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<RegistryState>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry {
            inner: Arc::new(RegistryState {
                families: Mutex::new(BTreeMap::new()),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn counter(
        &self,
        name: &'static str,
        help: &'static str,
        labels: &[(&str, &str)],
    ) -> Counter {
        let mut families = self.inner.families.lock().expect("metrics lock poisoned");
        let family = families.entry(name).or_insert_with(|| Family {
            help,
            kind: MetricKind::Counter,
            series: BTreeMap::new(),
        });
        let key = label_key(labels);
        let cell = match family
            .series
            .entry(key)
            .or_insert_with(|| Series::Counter(Arc::new(AtomicU64::new(0))))
        {
            Series::Counter(c) => Arc::clone(c),
            _ => panic!("metric {name} registered with a different kind"),
        };
        Counter { cell }
    }

    pub fn gauge(&self, name: &'static str, help: &'static str, labels: &[(&str, &str)]) -> Gauge {
        let mut families = self.inner.families.lock().expect("metrics lock poisoned");
        let family = families.entry(name).or_insert_with(|| Family {
            help,
            kind: MetricKind::Gauge,
            series: BTreeMap::new(),
        });
        let key = label_key(labels);
        let bits = match family
            .series
            .entry(key)
            .or_insert_with(|| Series::Gauge(Arc::new(AtomicU64::new(0f64.to_bits()))))
        {
            Series::Gauge(g) => Arc::clone(g),
            _ => panic!("metric {name} registered with a different kind"),
        };
        Gauge { bits }
    }

    pub fn histogram(
        &self,
        name: &'static str,
        help: &'static str,
        labels: &[(&str, &str)],
    ) -> Histogram {
        let mut families = self.inner.families.lock().expect("metrics lock poisoned");
        let family = families.entry(name).or_insert_with(|| Family {
            help,
            kind: MetricKind::Histogram,
            series: BTreeMap::new(),
        });
        let key = label_key(labels);
        let core = match family.series.entry(key).or_insert_with(|| {
            let bounds = LATENCY_BUCKETS.clone();
            let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
            Series::Histogram(Arc::new(HistogramCore {
                bounds,
                buckets,
                sum_bits: AtomicU64::new(0f64.to_bits()),
                count: AtomicU64::new(0),
            }))
        }) {
            Series::Histogram(h) => Arc::clone(h),
            _ => panic!("metric {name} registered with a different kind"),
        };
        Histogram { core }
    }

    /// Seconds since the registry (i.e. the process) came up.
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render the whole registry as a text exposition for scraping.
    pub fn render(&self) -> String {
        let families = self.inner.families.lock().expect("metrics lock poisoned");
        let mut out = String::with_capacity(4096);
        for (name, family) in families.iter() {
            out.push_str(&format!("# HELP {} {}\n", name, family.help));
            out.push_str(&format!("# TYPE {} {}\n", name, family.kind.as_str()));
            for (labels, series) in &family.series {
                match series {
                    Series::Counter(c) => {
                        render_line(&mut out, name, labels, &c.load(Ordering::Relaxed).to_string());
                    }
                    Series::Gauge(g) => {
                        let v = f64::from_bits(g.load(Ordering::Relaxed));
                        render_line(&mut out, name, labels, &format_float(v));
                    }
                    Series::Histogram(h) => {
                        for (i, bound) in h.bounds.iter().enumerate() {
                            let le = format!("le=\"{}\"", format_float(*bound));
                            let merged = if labels.is_empty() {
                                le
                            } else {
                                format!("{labels},{le}")
                            };
                            render_line(
                                &mut out,
                                &format!("{name}_bucket"),
                                &merged,
                                &h.buckets[i].load(Ordering::Relaxed).to_string(),
                            );
                        }
                        let inf = if labels.is_empty() {
                            "le=\"+Inf\"".to_string()
                        } else {
                            format!("{labels},le=\"+Inf\"")
                        };
                        let count = h.count.load(Ordering::Relaxed);
                        render_line(&mut out, &format!("{name}_bucket"), &inf, &count.to_string());
                        let sum = f64::from_bits(h.sum_bits.load(Ordering::Relaxed));
                        render_line(&mut out, &format!("{name}_sum"), labels, &format_float(sum));
                        render_line(&mut out, &format!("{name}_count"), labels, &count.to_string());
                    }
                }
            }
        }
        out.push_str("# HELP uptime_seconds Seconds since collector start\n");
        out.push_str("# TYPE uptime_seconds gauge\n");
        out.push_str(&format!("uptime_seconds {}\n", self.uptime_seconds()));
        out
    }
}

fn label_key(labels: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    pairs.sort();
    pairs.join(",")
}

fn render_line(out: &mut String, name: &str, labels: &str, value: &str) {
    if labels.is_empty() {
        out.push_str(&format!("{name} {value}\n"));
    } else {
        out.push_str(&format!("{name}{{{labels}}} {value}\n"));
    }
}

fn format_float(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_inc_and_add() {
        let reg = MetricsRegistry::new();
        let c = reg.counter("reads_total", "total reads", &[("device", "a")]);
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_same_name_labels_share_series() {
        let reg = MetricsRegistry::new();
        let a = reg.counter("reads_total", "total reads", &[("device", "a")]);
        let b = reg.counter("reads_total", "total reads", &[("device", "a")]);
        a.inc();
        b.inc();
        assert_eq!(a.get(), 2);
    }

    #[test]
    fn test_different_labels_are_distinct_series() {
        let reg = MetricsRegistry::new();
        let a = reg.counter("reads_total", "total reads", &[("device", "a")]);
        let b = reg.counter("reads_total", "total reads", &[("device", "b")]);
        a.inc();
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn test_gauge_set_get() {
        let reg = MetricsRegistry::new();
        let g = reg.gauge("rate_gauge", "pulses/s", &[("device", "a"), ("channel", "0")]);
        g.set(123.5);
        assert_eq!(g.get(), 123.5);
    }

    #[test]
    fn test_histogram_observe_counts_and_sum() {
        let reg = MetricsRegistry::new();
        let h = reg.histogram("read_latency_seconds", "latency", &[]);
        h.observe(0.002);
        h.observe(0.2);
        h.observe(100.0); // beyond the last bound, only +Inf
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 100.202).abs() < 1e-9);
    }

    #[test]
    fn test_render_contains_help_type_and_series() {
        let reg = MetricsRegistry::new();
        reg.counter("bus_dropped_total", "dropped readings", &[]).add(7);
        reg.gauge("device_up", "1 when polling ok", &[("device", "a")]).set(1.0);
        let text = reg.render();
        assert!(text.contains("# HELP bus_dropped_total dropped readings"));
        assert!(text.contains("# TYPE bus_dropped_total counter"));
        assert!(text.contains("bus_dropped_total 7"));
        assert!(text.contains("device_up{device=\"a\"} 1.0"));
        assert!(text.contains("uptime_seconds"));
    }

    #[test]
    fn test_render_histogram_buckets_cumulative() {
        let reg = MetricsRegistry::new();
        let h = reg.histogram("lat", "l", &[("device", "a")]);
        h.observe(0.0001); // below first bound: lands in every bucket
        let text = reg.render();
        assert!(text.contains("lat_bucket{device=\"a\",le=\"0.001\"} 1"));
        assert!(text.contains("lat_bucket{device=\"a\",le=\"+Inf\"} 1"));
        assert!(text.contains("lat_count{device=\"a\"} 1"));
    }

    #[test]
    fn test_label_key_sorted_and_escaped() {
        let key = label_key(&[("b", "2"), ("a", "say \"hi\"")]);
        assert_eq!(key, "a=\"say \\\"hi\\\"\",b=\"2\"");
    }

    #[test]
    fn test_uptime_smoke() {
        let reg = MetricsRegistry::new();
        assert!(reg.uptime_seconds() < 5);
    }
}
