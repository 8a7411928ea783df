//! Sharded, concurrently writable metric storage.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::summary::{DurationSummary, GaugeSummary, MetricSummary, MetricsSnapshot};
use super::{percentile, MetricDecl, MetricError, MetricKind, Sample};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Default)]
struct GaugeState {
    last: f64,
    min: f64,
    max: f64,
    sum: f64,
    writes: u64,
}

impl GaugeState {
    fn set(&mut self, value: f64) {
        if self.writes == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.last = value;
        self.sum += value;
        self.writes += 1;
    }
}

#[derive(Debug, Clone)]
enum MetricState {
    Duration(Vec<f64>),
    Counter { total: u64, writes: u64 },
    Rate { trues: u64, total: u64 },
    Gauge(GaugeState),
}

impl MetricState {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Duration => MetricState::Duration(Vec::new()),
            MetricKind::Counter => MetricState::Counter {
                total: 0,
                writes: 0,
            },
            MetricKind::Rate => MetricState::Rate { trues: 0, total: 0 },
            MetricKind::Gauge => MetricState::Gauge(GaugeState::default()),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            MetricState::Duration(_) => MetricKind::Duration,
            MetricState::Counter { .. } => MetricKind::Counter,
            MetricState::Rate { .. } => MetricKind::Rate,
            MetricState::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Apply a sample whose kind already matches
    fn apply(&mut self, sample: Sample) -> f64 {
        match (self, sample) {
            (MetricState::Duration(samples), Sample::Duration(v)) => {
                samples.push(v);
                v
            }
            (MetricState::Counter { total, writes }, Sample::Counter(n)) => {
                *total = total.saturating_add(n);
                *writes += 1;
                *total as f64
            }
            (MetricState::Rate { trues, total }, Sample::Rate(ok)) => {
                if ok {
                    *trues += 1;
                }
                *total += 1;
                if ok {
                    1.0
                } else {
                    0.0
                }
            }
            (MetricState::Gauge(g), Sample::Gauge(v)) => {
                g.set(v);
                v
            }
            (MetricState::Gauge(g), Sample::GaugeDelta(d)) => {
                let value = g.last + d;
                g.set(value);
                value
            }
            // Kinds are checked by the caller before applying
            _ => f64::NAN,
        }
    }

    fn summarize(&self, elapsed: Duration) -> MetricSummary {
        match self {
            MetricState::Duration(samples) => {
                let mut sorted = samples.clone();
                percentile::sort_samples(&mut sorted);
                MetricSummary::Duration(DurationSummary::from_sorted(sorted))
            }
            MetricState::Counter { total, writes } => {
                let secs = elapsed.as_secs_f64();
                MetricSummary::Counter {
                    count: *total,
                    rate: if secs > 0.0 { *total as f64 / secs } else { 0.0 },
                    writes: *writes,
                }
            }
            MetricState::Rate { trues, total } => MetricSummary::Rate {
                rate: if *total == 0 {
                    0.0
                } else {
                    *trues as f64 / *total as f64
                },
                passes: *trues,
                total: *total,
            },
            MetricState::Gauge(g) => MetricSummary::Gauge(GaugeSummary {
                value: g.last,
                min: g.min,
                max: g.max,
                avg: if g.writes == 0 {
                    0.0
                } else {
                    g.sum / g.writes as f64
                },
                writes: g.writes,
            }),
        }
    }
}

type Shard = Mutex<HashMap<String, MetricState>>;

#[derive(Debug)]
struct SinkInner {
    shards: Box<[Shard]>,
    /// Reference point for per-second counter rates
    since: Mutex<Instant>,
}

/// Shared handle to the run's metric storage
///
/// Cloning the handle is cheap; all clones write into the same storage.
/// Each write holds one shard lock for the duration of a single push or
/// add, so a sample is either fully recorded or not at all.
#[derive(Debug, Clone)]
pub struct MetricSink {
    inner: Arc<SinkInner>,
}

impl Default for MetricSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink {
    /// Create an empty sink
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(SinkInner {
                shards,
                since: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Restart the clock counter rates are measured against
    ///
    /// Called when scheduling begins so time spent between construction and
    /// execution does not dilute per-second rates.
    pub fn mark_start(&self) {
        *self.inner.since.lock() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.inner.since.lock().elapsed()
    }

    fn shard(&self, name: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.inner.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Register a metric ahead of its first sample
    ///
    /// Registering an existing metric with the same kind is a no-op.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        let mut shard = self.shard(name).lock();
        match shard.get(name) {
            Some(state) if state.kind() != kind => Err(MetricError::KindMismatch {
                name: name.to_string(),
                registered: state.kind(),
                attempted: kind,
            }),
            Some(_) => Ok(()),
            None => {
                shard.insert(name.to_string(), MetricState::empty(kind));
                Ok(())
            }
        }
    }

    /// Register every declared metric
    pub fn register_all<'a>(
        &self,
        decls: impl IntoIterator<Item = &'a MetricDecl>,
    ) -> Result<(), MetricError> {
        for decl in decls {
            self.register(&decl.name, decl.kind)?;
        }
        Ok(())
    }

    /// Record a sample, auto-registering unknown metrics with the sample's kind
    ///
    /// Returns the value the metric now holds for gauges, the new total for
    /// counters, and the sample itself otherwise.
    pub fn record(&self, name: &str, sample: Sample) -> Result<f64, MetricError> {
        let kind = sample.kind();
        let mut shard = self.shard(name).lock();
        if let Some(state) = shard.get_mut(name) {
            if state.kind() != kind {
                return Err(MetricError::KindMismatch {
                    name: name.to_string(),
                    registered: state.kind(),
                    attempted: kind,
                });
            }
            return Ok(state.apply(sample));
        }
        let mut state = MetricState::empty(kind);
        let value = state.apply(sample);
        shard.insert(name.to_string(), state);
        Ok(value)
    }

    /// Record an elapsed wall-clock time in milliseconds
    pub fn add_duration(&self, name: &str, elapsed: Duration) -> Result<(), MetricError> {
        self.record(name, Sample::elapsed(elapsed)).map(|_| ())
    }

    /// Record a raw duration-kind value (e.g. a depth or size trend)
    pub fn add_trend(&self, name: &str, value: f64) -> Result<(), MetricError> {
        self.record(name, Sample::Duration(value)).map(|_| ())
    }

    /// Add to a counter
    pub fn add_count(&self, name: &str, n: u64) -> Result<(), MetricError> {
        self.record(name, Sample::Counter(n)).map(|_| ())
    }

    /// Record one boolean outcome into a rate
    pub fn add_rate(&self, name: &str, outcome: bool) -> Result<(), MetricError> {
        self.record(name, Sample::Rate(outcome)).map(|_| ())
    }

    /// Set a gauge to an absolute value
    pub fn set_gauge(&self, name: &str, value: f64) -> Result<(), MetricError> {
        self.record(name, Sample::Gauge(value)).map(|_| ())
    }

    /// Apply a delta to a gauge's current value, returning the new value
    pub fn adjust_gauge(&self, name: &str, delta: f64) -> Result<f64, MetricError> {
        self.record(name, Sample::GaugeDelta(delta))
    }

    /// Kind of a registered metric
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.shard(name).lock().get(name).map(MetricState::kind)
    }

    /// Aggregate of a single metric
    pub fn snapshot(&self, name: &str) -> Option<MetricSummary> {
        let elapsed = self.elapsed();
        let state = self.shard(name).lock().get(name).cloned();
        state.map(|s| s.summarize(elapsed))
    }

    /// Aggregate of every metric
    ///
    /// Each shard is copied under its lock and summarized afterwards, so
    /// writers are never blocked by the sort.
    pub fn snapshot_all(&self) -> MetricsSnapshot {
        let elapsed = self.elapsed();
        let mut copied = Vec::new();
        for shard in self.inner.shards.iter() {
            let guard = shard.lock();
            copied.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let metrics: BTreeMap<String, MetricSummary> = copied
            .into_iter()
            .map(|(name, state)| (name, state.summarize(elapsed)))
            .collect();
        MetricsSnapshot { elapsed, metrics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_percentiles() {
        let sink = MetricSink::new();
        for v in [100.0, 5.0, 20.0, 10.0, 10.0] {
            sink.add_trend("rpc_call_duration", v).unwrap();
        }
        match sink.snapshot("rpc_call_duration").unwrap() {
            MetricSummary::Duration(d) => {
                assert_eq!(d.p50, 10.0);
                assert_eq!(d.p95, 100.0);
                assert_eq!(d.count, 5);
            }
            other => panic!("unexpected summary {:?}", other),
        }
    }

    #[test]
    fn test_rate_without_writes_is_zero() {
        let sink = MetricSink::new();
        sink.register("request_errors", MetricKind::Rate).unwrap();
        assert_eq!(
            sink.snapshot("request_errors").unwrap(),
            MetricSummary::Rate {
                rate: 0.0,
                passes: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_rate_fraction() {
        let sink = MetricSink::new();
        sink.add_rate("crash_recovery_success", true).unwrap();
        sink.add_rate("crash_recovery_success", true).unwrap();
        sink.add_rate("crash_recovery_success", false).unwrap();
        sink.add_rate("crash_recovery_success", true).unwrap();
        let snapshot = sink.snapshot_all();
        assert_eq!(snapshot.rate("crash_recovery_success"), Some(0.75));
    }

    #[test]
    fn test_counter_accumulates() {
        let sink = MetricSink::new();
        sink.add_count("cross_node_messages", 3).unwrap();
        sink.add_count("cross_node_messages", 4).unwrap();
        assert_eq!(sink.snapshot_all().count("cross_node_messages"), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_rate_measured_from_run_start() {
        let sink = MetricSink::new();
        sink.register("cross_node_messages", MetricKind::Counter).unwrap();

        // idle time before scheduling does not count
        tokio::time::advance(Duration::from_secs(10)).await;
        sink.mark_start();
        sink.add_count("cross_node_messages", 10).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        match sink.snapshot("cross_node_messages").unwrap() {
            MetricSummary::Counter { count, rate, .. } => {
                assert_eq!(count, 10);
                assert!((rate - 2.0).abs() < 1e-9, "rate {}", rate);
            }
            other => panic!("unexpected summary {:?}", other),
        }
    }

    #[test]
    fn test_gauge_tracks_min_max_avg() {
        let sink = MetricSink::new();
        for v in [3.0, 5.0, 2.0, 4.0] {
            sink.set_gauge("nodes_alive", v).unwrap();
        }
        let snapshot = sink.snapshot_all();
        let gauge = snapshot.gauge("nodes_alive").unwrap();
        assert_eq!(gauge.value, 4.0);
        assert_eq!(gauge.min, 2.0);
        assert_eq!(gauge.max, 5.0);
        assert_eq!(gauge.avg, 3.5);
        assert_eq!(gauge.writes, 4);
    }

    #[test]
    fn test_gauge_adjust_tracks_concurrency() {
        let sink = MetricSink::new();
        assert_eq!(sink.adjust_gauge("concurrent_websockets", 1.0).unwrap(), 1.0);
        assert_eq!(sink.adjust_gauge("concurrent_websockets", 1.0).unwrap(), 2.0);
        assert_eq!(sink.adjust_gauge("concurrent_websockets", -1.0).unwrap(), 1.0);
        let snapshot = sink.snapshot_all();
        let gauge = snapshot.gauge("concurrent_websockets").unwrap();
        assert_eq!(gauge.max, 2.0);
        assert_eq!(gauge.value, 1.0);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let sink = MetricSink::new();
        sink.add_trend("failover_duration", 10.0).unwrap();
        let err = sink.add_count("failover_duration", 1).unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                name: "failover_duration".to_string(),
                registered: MetricKind::Duration,
                attempted: MetricKind::Counter,
            }
        );
        // The rejected write must not have altered the metric
        assert_eq!(sink.snapshot_all().duration("failover_duration").unwrap().count, 1);
    }

    #[test]
    fn test_register_conflicting_kind() {
        let sink = MetricSink::new();
        sink.register("errors", MetricKind::Counter).unwrap();
        sink.register("errors", MetricKind::Counter).unwrap();
        assert!(sink.register("errors", MetricKind::Rate).is_err());
        assert_eq!(sink.kind_of("errors"), Some(MetricKind::Counter));
    }

    #[test]
    fn test_unknown_metric_has_no_snapshot() {
        let sink = MetricSink::new();
        assert!(sink.snapshot("missing").is_none());
        assert!(sink.snapshot_all().get("missing").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let sink = MetricSink::new();
        let mut handles = Vec::new();
        for worker in 0..32 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..500 {
                    sink.add_count("requests", 1).unwrap();
                    sink.add_trend("latency", (worker * 500 + i) as f64).unwrap();
                    sink.add_rate("ok", i % 2 == 0).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = sink.snapshot_all();
        assert_eq!(snapshot.count("requests"), 16_000);
        assert_eq!(snapshot.duration("latency").unwrap().count, 16_000);
        assert_eq!(snapshot.rate("ok"), Some(0.5));
    }
}
