use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    // f64 bits, so the value can be updated atomically
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0f64.to_bits() as i64),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = f64::from_bits(current as u64) + delta;
                Some(next.to_bits() as i64)
            });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Keeps every observation; session durations are low-volume.
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }
    fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.total_cmp(b));
        let count = obs.len();
        let pick = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: obs.iter().sum(),
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn sample<T>(&self, value: T) -> MetricSample<T> {
        MetricSample {
            name: self.name.clone(),
            labels: self.labels.iter().cloned().collect(),
            value,
        }
    }
}

/// One labelled value in a [`MetricsSnapshot`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricSample<T> {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: T,
}

/// Point-in-time copy of every metric, sorted by name.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<MetricSample<u64>>,
    pub gauges: Vec<MetricSample<f64>>,
    pub histograms: Vec<MetricSample<HistogramSummary>>,
}

/// Apply `update` to the metric at `key`, creating it on first use. The
/// common path only takes the read lock.
fn upsert<M>(
    map: &RwLock<HashMap<MetricKey, M>>,
    key: MetricKey,
    create: fn() -> M,
    update: impl Fn(&M),
) {
    if let Some(metric) = map.read().get(&key) {
        update(metric);
        return;
    }
    update(map.write().entry(key).or_insert_with(create));
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        upsert(&self.counters, MetricKey::new(name, labels), Counter::new, |c| c.increment(n));
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        upsert(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| g.set(value));
    }

    /// Add `delta` (may be negative), starting from zero.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        upsert(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| g.increment(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        upsert(&self.histograms, MetricKey::new(name, labels), Histogram::new, |h| h.observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, |c| c.get())
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, |g| g.get())
    }

    /// Copy out every current value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| k.sample(c.get()))
            .collect();
        let mut gauges: Vec<_> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| k.sample(g.get()))
            .collect();
        let mut histograms: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| k.sample(h.summary()))
            .collect();
        counters.sort_by(|a, b| a.name.cmp(&b.name));
        gauges.sort_by(|a, b| a.name.cmp(&b.name));
        histograms.sort_by(|a, b| a.name.cmp(&b.name));
        MetricsSnapshot {
            counters,
            gauges,
            histograms,
        }
    }
}
