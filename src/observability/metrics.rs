//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Hold every counter, gauge and histogram series of the process
//! - Render them in the Prometheus text exposition format
//! - Back the `metrics` crate facade so `metrics::counter!` and friends land
//!   in the same registry
//!
//! # Metrics
//! - `app_requests_total` (counter): requests by method, route, status class
//! - `app_request_duration_seconds` (histogram): latency by method, route
//! - `app_requests_in_flight` (gauge): requests currently being handled
//! - `trace_export_spans_total` (counter): spans by export outcome
//!
//! # Design Decisions
//! - Series live in a sharded concurrent map; a lookup only holds one shard lock
//! - Counters and gauges are atomics; a histogram update holds only that
//!   series' mutex, so bucket counts, sum and count always agree
//! - Rendering sorts families by name and series by label set, so repeated
//!   scrapes with no new observations are byte-identical
//! - Each metric name is capped at `max_series_per_metric` label sets; further
//!   label sets are folded into one series whose label values are `__overflow__`

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};

use crate::config::schema::MetricsConfig;

pub const REQUESTS_TOTAL: &str = "app_requests_total";
pub const REQUEST_DURATION: &str = "app_request_duration_seconds";
pub const REQUESTS_IN_FLIGHT: &str = "app_requests_in_flight";
pub const SPAN_EXPORT_TOTAL: &str = "trace_export_spans_total";

/// Prometheus client default latency buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Label value used by the series that absorbs label sets past the cap.
pub const OVERFLOW_LABEL_VALUE: &str = "__overflow__";

pub const DEFAULT_MAX_SERIES_PER_METRIC: usize = 1000;

/// Metric family type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// Label set sorted by key.
pub type Labels = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Labels,
}

impl SeriesKey {
    fn new<'a>(name: &str, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut labels: Labels = labels
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn overflow(&self) -> Self {
        Self {
            name: self.name.clone(),
            labels: self
                .labels
                .iter()
                .map(|(k, _)| (k.clone(), OVERFLOW_LABEL_VALUE.to_string()))
                .collect(),
        }
    }
}

struct CounterCell(AtomicU64);

impl CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

/// f64 stored as its bit pattern.
struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }
}

impl GaugeFn for GaugeCell {
    fn increment(&self, value: f64) {
        self.update(|v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|v| v - value);
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct HistogramState {
    bounds: Arc<[f64]>,
    /// Cumulative: `buckets[i]` counts observations `<= bounds[i]`.
    buckets: Vec<u64>,
    sum: f64,
    count: u64,
}

struct HistogramCell(Mutex<HistogramState>);

impl HistogramCell {
    fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = vec![0; bounds.len()];
        Self(Mutex::new(HistogramState {
            bounds,
            buckets,
            sum: 0.0,
            count: 0,
        }))
    }

    fn observe(&self, value: f64) {
        if value.is_nan() {
            tracing::debug!("Ignoring NaN histogram observation");
            return;
        }
        let Ok(mut state) = self.0.lock() else {
            return;
        };
        let state = &mut *state;
        for (bound, bucket) in state.bounds.iter().zip(state.buckets.iter_mut()) {
            if value <= *bound {
                *bucket += 1;
            }
        }
        state.sum += value;
        state.count += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        match self.0.lock() {
            Ok(state) => HistogramSnapshot {
                buckets: state.bounds.iter().copied().zip(state.buckets.iter().copied()).collect(),
                sum: state.sum,
                count: state.count,
            },
            Err(_) => HistogramSnapshot::default(),
        }
    }
}

impl HistogramFn for HistogramCell {
    fn record(&self, value: f64) {
        self.observe(value);
    }
}

/// Point-in-time view of one histogram series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper bound, cumulative count)`, ascending, without `+Inf`.
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    /// Equals the `+Inf` bucket.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Cumulative count of the bucket with upper bound `le`.
    pub fn bucket(&self, le: f64) -> Option<u64> {
        self.buckets.iter().find(|(b, _)| *b == le).map(|(_, c)| *c)
    }
}

#[derive(Clone)]
enum Series {
    Counter(Arc<CounterCell>),
    Gauge(Arc<GaugeCell>),
    Histogram(Arc<HistogramCell>),
}

impl Series {
    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }
}

struct Family {
    kind: MetricKind,
    help: Option<String>,
    series: usize,
}

struct Registry {
    families: DashMap<String, Family>,
    series: DashMap<SeriesKey, Series>,
    default_buckets: Arc<[f64]>,
    max_series_per_metric: usize,
}

impl Registry {
    /// Find or create the series for `key`.
    ///
    /// Returns `None` if `key.name` is already registered as another kind.
    fn resolve(&self, key: SeriesKey, kind: MetricKind) -> Option<Series> {
        if let Some(series) = self.series.get(&key) {
            return (series.kind() == kind).then(|| series.clone());
        }

        // families before series, always
        let mut family = self
            .families
            .entry(key.name.clone())
            .or_insert_with(|| Family {
                kind,
                help: None,
                series: 0,
            });
        if family.kind != kind {
            tracing::debug!(
                metric = %key.name,
                registered = family.kind.as_str(),
                requested = kind.as_str(),
                "Metric kind mismatch, ignoring update"
            );
            return None;
        }

        let key = if family.series >= self.max_series_per_metric
            && !key.labels.is_empty()
            && !self.series.contains_key(&key)
        {
            tracing::debug!(metric = %key.name, "Series cap reached, folding into overflow series");
            key.overflow()
        } else {
            key
        };

        let bounds = self.default_buckets.clone();
        let series = self
            .series
            .entry(key)
            .or_insert_with(|| {
                family.series += 1;
                match kind {
                    MetricKind::Counter => Series::Counter(Arc::new(CounterCell(AtomicU64::new(0)))),
                    MetricKind::Gauge => Series::Gauge(Arc::new(GaugeCell::new())),
                    MetricKind::Histogram => Series::Histogram(Arc::new(HistogramCell::new(bounds))),
                }
            })
            .clone();
        Some(series)
    }

    fn describe(&self, name: &str, kind: MetricKind, help: &str) {
        let mut family = self.families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: None,
            series: 0,
        });
        if family.kind == kind {
            family.help = Some(help.to_string());
        }
    }

    fn find(&self, key: &SeriesKey) -> Option<Series> {
        self.series.get(key).map(|s| s.clone())
    }
}

/// Process-wide metric registry. Clones share state.
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Arc<Registry>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUCKETS.to_vec(), DEFAULT_MAX_SERIES_PER_METRIC)
    }

    pub fn with_config(config: &MetricsConfig) -> Self {
        Self::with_limits(config.histogram_buckets.clone(), config.max_series_per_metric)
    }

    /// `buckets` must be ascending; every histogram uses them.
    pub fn with_limits(buckets: Vec<f64>, max_series_per_metric: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                families: DashMap::new(),
                series: DashMap::new(),
                default_buckets: buckets.into(),
                max_series_per_metric: max_series_per_metric.max(1),
            }),
        }
    }

    /// Attach help text to a metric family.
    pub fn describe(&self, name: &str, kind: MetricKind, help: &str) {
        self.registry.describe(name, kind, help);
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let key = SeriesKey::new(name, labels.iter().copied());
        if let Some(Series::Counter(cell)) = self.registry.resolve(key, MetricKind::Counter) {
            cell.increment(value);
        }
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = SeriesKey::new(name, labels.iter().copied());
        if let Some(Series::Gauge(cell)) = self.registry.resolve(key, MetricKind::Gauge) {
            cell.increment(delta);
        }
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels.iter().copied());
        if let Some(Series::Gauge(cell)) = self.registry.resolve(key, MetricKind::Gauge) {
            cell.set(value);
        }
    }

    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels.iter().copied());
        if let Some(Series::Histogram(cell)) = self.registry.resolve(key, MetricKind::Histogram) {
            cell.observe(value);
        }
    }

    /// Current value of a counter series, if it exists.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        match self.registry.find(&SeriesKey::new(name, labels.iter().copied()))? {
            Series::Counter(cell) => Some(cell.0.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    /// Every series of counter `name` with its value, sorted by label set.
    pub fn counter_series(&self, name: &str) -> Vec<(Labels, u64)> {
        let mut series: Vec<(Labels, u64)> = self
            .registry
            .series
            .iter()
            .filter(|entry| entry.key().name == name)
            .filter_map(|entry| match entry.value() {
                Series::Counter(cell) => {
                    Some((entry.key().labels.clone(), cell.0.load(Ordering::Relaxed)))
                }
                _ => None,
            })
            .collect();
        series.sort();
        series
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match self.registry.find(&SeriesKey::new(name, labels.iter().copied()))? {
            Series::Gauge(cell) => Some(cell.get()),
            _ => None,
        }
    }

    pub fn histogram_snapshot(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        match self.registry.find(&SeriesKey::new(name, labels.iter().copied()))? {
            Series::Histogram(cell) => Some(cell.snapshot()),
            _ => None,
        }
    }

    /// Number of series under `name`.
    pub fn series_count(&self, name: &str) -> usize {
        self.registry
            .series
            .iter()
            .filter(|entry| entry.key().name == name)
            .count()
    }

    /// Prometheus text exposition (format 0.0.4) of every family.
    pub fn render_snapshot(&self) -> String {
        let mut by_family: BTreeMap<String, BTreeMap<Labels, Series>> = BTreeMap::new();
        for entry in self.registry.series.iter() {
            by_family
                .entry(entry.key().name.clone())
                .or_default()
                .insert(entry.key().labels.clone(), entry.value().clone());
        }

        let mut meta: BTreeMap<String, (MetricKind, Option<String>)> = self
            .registry
            .families
            .iter()
            .map(|f| (f.key().clone(), (f.kind, f.help.clone())))
            .collect();
        for name in by_family.keys() {
            if !meta.contains_key(name) {
                if let Some(series) = by_family[name].values().next() {
                    meta.insert(name.clone(), (series.kind(), None));
                }
            }
        }

        let mut out = String::new();
        for (name, (kind, help)) in &meta {
            if let Some(help) = help {
                let _ = writeln!(out, "# HELP {} {}", name, escape_help(help));
            }
            let _ = writeln!(out, "# TYPE {} {}", name, kind.as_str());

            let Some(series) = by_family.get(name) else {
                continue;
            };
            for (labels, series) in series {
                match series {
                    Series::Counter(cell) => {
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            name,
                            format_labels(labels, None),
                            cell.0.load(Ordering::Relaxed)
                        );
                    }
                    Series::Gauge(cell) => {
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            name,
                            format_labels(labels, None),
                            format_float(cell.get())
                        );
                    }
                    Series::Histogram(cell) => render_histogram(&mut out, name, labels, &cell.snapshot()),
                }
            }
        }
        out
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("families", &self.registry.families.len())
            .field("series", &self.registry.series.len())
            .finish()
    }
}

fn render_histogram(out: &mut String, name: &str, labels: &Labels, snapshot: &HistogramSnapshot) {
    for (bound, count) in &snapshot.buckets {
        let le = format_float(*bound);
        let _ = writeln!(
            out,
            "{}_bucket{} {}",
            name,
            format_labels(labels, Some(&le)),
            count
        );
    }
    let _ = writeln!(
        out,
        "{}_bucket{} {}",
        name,
        format_labels(labels, Some("+Inf")),
        snapshot.count
    );
    let _ = writeln!(out, "{}_sum{} {}", name, format_labels(labels, None), format_float(snapshot.sum));
    let _ = writeln!(out, "{}_count{} {}", name, format_labels(labels, None), snapshot.count);
}

fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{}\"", le));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn facade_key(key: &Key) -> SeriesKey {
    SeriesKey::new(key.name(), key.labels().map(|l| (l.key(), l.value())))
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key.as_str(), MetricKind::Counter, &description);
    }

    fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key.as_str(), MetricKind::Gauge, &description);
    }

    fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key.as_str(), MetricKind::Histogram, &description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        match self.registry.resolve(facade_key(key), MetricKind::Counter) {
            Some(Series::Counter(cell)) => Counter::from_arc(cell),
            _ => Counter::noop(),
        }
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        match self.registry.resolve(facade_key(key), MetricKind::Gauge) {
            Some(Series::Gauge(cell)) => Gauge::from_arc(cell),
            _ => Gauge::noop(),
        }
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        match self.registry.resolve(facade_key(key), MetricKind::Histogram) {
            Some(Series::Histogram(cell)) => Histogram::from_arc(cell),
            _ => Histogram::noop(),
        }
    }
}
