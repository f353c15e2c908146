use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    spill_bytes: CounterVec,
    spill_pages: CounterVec,
    spill_read_bytes: CounterVec,
    spill_time_seconds: HistogramVec,
    spill_files_open: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_spill(&self, codec: &str, bytes: u64, pages: u64, secs: f64) {
        let labels = [codec];
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .spill_pages
            .with_label_values(&labels)
            .inc_by(pages as f64);
        self.inner
            .spill_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_spill_read(&self, codec: &str, bytes: u64) {
        self.inner
            .spill_read_bytes
            .with_label_values(&[codec])
            .inc_by(bytes as f64);
    }

    pub fn inc_spill_files_open(&self, codec: &str) {
        self.inner.spill_files_open.with_label_values(&[codec]).inc();
    }

    pub fn dec_spill_files_open(&self, codec: &str) {
        self.inner.spill_files_open.with_label_values(&[codec]).dec();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let spill_bytes = counter_vec(
            &registry,
            "spillway_spill_bytes_total",
            "Serialized bytes appended to spill files",
            &["codec"],
        );
        let spill_pages = counter_vec(
            &registry,
            "spillway_spill_pages_total",
            "Pages appended to spill files",
            &["codec"],
        );
        let spill_read_bytes = counter_vec(
            &registry,
            "spillway_spill_read_bytes_total",
            "Serialized bytes read back from spill files",
            &["codec"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "spillway_spill_time_seconds",
            "Spill write time",
            &["codec"],
        );
        let spill_files_open = gauge_vec(
            &registry,
            "spillway_spill_files_open",
            "Spill files currently on disk",
            &["codec"],
        );

        Self {
            registry,
            spill_bytes,
            spill_pages,
            spill_read_bytes,
            spill_time_seconds,
            spill_files_open,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

/// Aggregate spill counters written by every spiller sharing this instance.
///
/// Counters only grow; callers observe them through [`SpillerStats::snapshot`].
#[derive(Debug, Default)]
pub struct SpillerStats {
    spilled_bytes: AtomicU64,
    spilled_pages: AtomicU64,
    read_bytes: AtomicU64,
    spill_nanos: AtomicU64,
}

/// Point-in-time copy of [`SpillerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpillerStatsSnapshot {
    pub spilled_bytes: u64,
    pub spilled_pages: u64,
    pub read_bytes: u64,
    pub spill_time: Duration,
}

impl SpillerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_spilled(&self, bytes: u64, pages: u64, elapsed: Duration) {
        self.spilled_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.spilled_pages.fetch_add(pages, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.spill_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn add_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SpillerStatsSnapshot {
        SpillerStatsSnapshot {
            spilled_bytes: self.spilled_bytes.load(Ordering::Relaxed),
            spilled_pages: self.spilled_pages.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            spill_time: Duration::from_nanos(self.spill_nanos.load(Ordering::Relaxed)),
        }
    }
}

static GLOBAL_SPILLER_STATS: OnceLock<Arc<SpillerStats>> = OnceLock::new();

/// Process-wide stats used when a factory is not given its own instance.
pub fn global_spiller_stats() -> Arc<SpillerStats> {
    Arc::clone(GLOBAL_SPILLER_STATS.get_or_init(SpillerStats::new))
}
