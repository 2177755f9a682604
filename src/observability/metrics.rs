//! Adapter-call metrics: attempt/outcome counters and latency histograms.
//!
//! Every adapter call made through the policy engine reports here. Counters
//! are monotonic and independent of business logic, so the in-memory sink
//! keeps them in fixed-size `AtomicU64` tables indexed by analyzer and result
//! label instead of a locked map.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::policy::{FailureKind, TerminalKind};

// ──────────────────────────────────────────────
// Labels
// ──────────────────────────────────────────────

/// Which collaborator an adapter call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    /// Vision-only baseline classifier.
    Vision,
    /// Vision-language model.
    Vlm,
    /// Per-page document extractor.
    Document,
    /// Language-model explainer.
    Explainer,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 4] = [
        AnalyzerKind::Vision,
        AnalyzerKind::Vlm,
        AnalyzerKind::Document,
        AnalyzerKind::Explainer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::Vision => "vision",
            AnalyzerKind::Vlm => "vlm",
            AnalyzerKind::Document => "document",
            AnalyzerKind::Explainer => "explainer",
        }
    }

    /// Pipeline stage the analyzer belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            AnalyzerKind::Explainer => Stage::Explanation,
            _ => Stage::Perception,
        }
    }

    fn index(&self) -> usize {
        match self {
            AnalyzerKind::Vision => 0,
            AnalyzerKind::Vlm => 1,
            AnalyzerKind::Document => 2,
            AnalyzerKind::Explainer => 3,
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Perception,
    Explanation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Perception => "perception",
            Stage::Explanation => "explanation",
        }
    }
}

/// Result label attached to attempt and outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultLabel {
    Ok,
    Timeout,
    InvalidOutput,
    TransientFailure,
    Fatal,
    RetriesExhausted,
}

impl ResultLabel {
    pub const ALL: [ResultLabel; 6] = [
        ResultLabel::Ok,
        ResultLabel::Timeout,
        ResultLabel::InvalidOutput,
        ResultLabel::TransientFailure,
        ResultLabel::Fatal,
        ResultLabel::RetriesExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultLabel::Ok => "ok",
            ResultLabel::Timeout => "timeout",
            ResultLabel::InvalidOutput => "invalid_output",
            ResultLabel::TransientFailure => "transient_failure",
            ResultLabel::Fatal => "fatal",
            ResultLabel::RetriesExhausted => "retries_exhausted",
        }
    }

    fn index(&self) -> usize {
        match self {
            ResultLabel::Ok => 0,
            ResultLabel::Timeout => 1,
            ResultLabel::InvalidOutput => 2,
            ResultLabel::TransientFailure => 3,
            ResultLabel::Fatal => 4,
            ResultLabel::RetriesExhausted => 5,
        }
    }
}

impl From<FailureKind> for ResultLabel {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => ResultLabel::Timeout,
            FailureKind::InvalidOutput => ResultLabel::InvalidOutput,
            FailureKind::TransientFailure => ResultLabel::TransientFailure,
            FailureKind::Fatal => ResultLabel::Fatal,
        }
    }
}

impl From<TerminalKind> for ResultLabel {
    fn from(kind: TerminalKind) -> Self {
        match kind {
            TerminalKind::Failed(kind) => kind.into(),
            TerminalKind::RetriesExhausted { .. } => ResultLabel::RetriesExhausted,
        }
    }
}

// ──────────────────────────────────────────────
// Sink trait
// ──────────────────────────────────────────────

/// Receiver for adapter-call observations.
pub trait MetricsSink: Send + Sync {
    /// One call per attempt, successful or not.
    fn record_attempt(&self, analyzer: AnalyzerKind, result: ResultLabel, elapsed: Duration);

    /// One call per terminal result of an adapter call.
    fn record_outcome(&self, analyzer: AnalyzerKind, result: ResultLabel);
}

/// Discards everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_attempt(&self, _analyzer: AnalyzerKind, _result: ResultLabel, _elapsed: Duration) {}

    fn record_outcome(&self, _analyzer: AnalyzerKind, _result: ResultLabel) {}
}

// ──────────────────────────────────────────────
// In-memory atomic sink
// ──────────────────────────────────────────────

/// Upper bounds (seconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_SECS: [f64; 11] =
    [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

const ANALYZERS: usize = AnalyzerKind::ALL.len();
const LABELS: usize = ResultLabel::ALL.len();
const BUCKETS: usize = LATENCY_BUCKETS_SECS.len();

struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        // Buckets are stored non-cumulative; the snapshot accumulates them.
        if let Some(i) = LATENCY_BUCKETS_SECS.iter().position(|bound| secs <= *bound) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self, analyzer: AnalyzerKind) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = LATENCY_BUCKETS_SECS
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, counter)| {
                cumulative += counter.load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot {
            analyzer,
            stage: analyzer.stage(),
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_secs: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Process-local metrics registry backed by atomics.
///
/// Shared behind an `Arc` by every pipeline instance that should report into
/// the same registry. `render_prometheus` produces the text exposition format
/// for whatever scrape endpoint the host application exposes.
pub struct AtomicMetrics {
    attempts: [[AtomicU64; LABELS]; ANALYZERS],
    outcomes: [[AtomicU64; LABELS]; ANALYZERS],
    latency: [LatencyHistogram; ANALYZERS],
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self {
            attempts: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            outcomes: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            latency: std::array::from_fn(|_| LatencyHistogram::new()),
        }
    }

    pub fn attempts(&self, analyzer: AnalyzerKind, result: ResultLabel) -> u64 {
        self.attempts[analyzer.index()][result.index()].load(Ordering::Relaxed)
    }

    pub fn outcomes(&self, analyzer: AnalyzerKind, result: ResultLabel) -> u64 {
        self.outcomes[analyzer.index()][result.index()].load(Ordering::Relaxed)
    }

    /// Consistent-enough copy of every counter (each value is read atomically).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut attempts = Vec::new();
        let mut outcomes = Vec::new();
        for analyzer in AnalyzerKind::ALL {
            for result in ResultLabel::ALL {
                let value = self.attempts(analyzer, result);
                if value > 0 {
                    attempts.push(CounterSample { analyzer, result, value });
                }
                let value = self.outcomes(analyzer, result);
                if value > 0 {
                    outcomes.push(CounterSample { analyzer, result, value });
                }
            }
        }
        let latency = AnalyzerKind::ALL
            .iter()
            .map(|analyzer| self.latency[analyzer.index()].snapshot(*analyzer))
            .filter(|h| h.count > 0)
            .collect();
        MetricsSnapshot {
            attempts,
            outcomes,
            latency,
        }
    }

    /// Prometheus text exposition of the current counters.
    pub fn render_prometheus(&self) -> String {
        self.snapshot().render_prometheus()
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for AtomicMetrics {
    fn record_attempt(&self, analyzer: AnalyzerKind, result: ResultLabel, elapsed: Duration) {
        self.attempts[analyzer.index()][result.index()].fetch_add(1, Ordering::Relaxed);
        self.latency[analyzer.index()].observe(elapsed);
    }

    fn record_outcome(&self, analyzer: AnalyzerKind, result: ResultLabel) {
        self.outcomes[analyzer.index()][result.index()].fetch_add(1, Ordering::Relaxed);
    }
}

// ──────────────────────────────────────────────
// Snapshot
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CounterSample {
    pub analyzer: AnalyzerKind,
    pub result: ResultLabel,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub analyzer: AnalyzerKind,
    pub stage: Stage,
    /// Cumulative `(upper_bound_secs, count)` pairs.
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub attempts: Vec<CounterSample>,
    pub outcomes: Vec<CounterSample>,
    pub latency: Vec<HistogramSnapshot>,
}

impl MetricsSnapshot {
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP adapter_attempts_total Adapter call attempts by analyzer and result\n");
        out.push_str("# TYPE adapter_attempts_total counter\n");
        for sample in &self.attempts {
            let _ = writeln!(
                out,
                "adapter_attempts_total{{stage=\"{}\",analyzer=\"{}\",result=\"{}\"}} {}",
                sample.analyzer.stage().as_str(),
                sample.analyzer.as_str(),
                sample.result.as_str(),
                sample.value
            );
        }

        out.push_str("# HELP adapter_outcomes_total Terminal adapter call results\n");
        out.push_str("# TYPE adapter_outcomes_total counter\n");
        for sample in &self.outcomes {
            let _ = writeln!(
                out,
                "adapter_outcomes_total{{stage=\"{}\",analyzer=\"{}\",result=\"{}\"}} {}",
                sample.analyzer.stage().as_str(),
                sample.analyzer.as_str(),
                sample.result.as_str(),
                sample.value
            );
        }

        out.push_str("# HELP adapter_attempt_seconds Adapter attempt latency\n");
        out.push_str("# TYPE adapter_attempt_seconds histogram\n");
        for histogram in &self.latency {
            let labels = format!(
                "stage=\"{}\",analyzer=\"{}\"",
                histogram.stage.as_str(),
                histogram.analyzer.as_str()
            );
            for (bound, count) in &histogram.buckets {
                let _ = writeln!(
                    out,
                    "adapter_attempt_seconds_bucket{{{labels},le=\"{bound}\"}} {count}"
                );
            }
            let _ = writeln!(
                out,
                "adapter_attempt_seconds_bucket{{{labels},le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(out, "adapter_attempt_seconds_sum{{{labels}}} {}", histogram.sum_secs);
            let _ = writeln!(out, "adapter_attempt_seconds_count{{{labels}}} {}", histogram.count);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = AtomicMetrics::new();
        for analyzer in AnalyzerKind::ALL {
            for result in ResultLabel::ALL {
                assert_eq!(metrics.attempts(analyzer, result), 0);
                assert_eq!(metrics.outcomes(analyzer, result), 0);
            }
        }
        assert!(metrics.snapshot().attempts.is_empty());
    }

    #[test]
    fn attempts_and_outcomes_are_tracked_separately() {
        let metrics = AtomicMetrics::new();
        metrics.record_attempt(AnalyzerKind::Vlm, ResultLabel::InvalidOutput, Duration::from_millis(10));
        metrics.record_attempt(AnalyzerKind::Vlm, ResultLabel::Ok, Duration::from_millis(20));
        metrics.record_outcome(AnalyzerKind::Vlm, ResultLabel::Ok);

        assert_eq!(metrics.attempts(AnalyzerKind::Vlm, ResultLabel::InvalidOutput), 1);
        assert_eq!(metrics.attempts(AnalyzerKind::Vlm, ResultLabel::Ok), 1);
        assert_eq!(metrics.outcomes(AnalyzerKind::Vlm, ResultLabel::Ok), 1);
        assert_eq!(metrics.outcomes(AnalyzerKind::Document, ResultLabel::Ok), 0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = AtomicMetrics::new();
        metrics.record_attempt(AnalyzerKind::Explainer, ResultLabel::Ok, Duration::from_millis(40));
        metrics.record_attempt(AnalyzerKind::Explainer, ResultLabel::Ok, Duration::from_millis(400));

        let snapshot = metrics.snapshot();
        let histogram = &snapshot.latency[0];
        assert_eq!(histogram.analyzer, AnalyzerKind::Explainer);
        assert_eq!(histogram.stage, Stage::Explanation);
        assert_eq!(histogram.count, 2);
        assert_eq!(histogram.buckets[0], (0.05, 1));
        assert_eq!(histogram.buckets[3], (0.5, 2));
        assert_eq!(histogram.buckets.last().map(|b| b.1), Some(2));
    }

    #[test]
    fn slow_attempts_only_land_in_inf_bucket() {
        let metrics = AtomicMetrics::new();
        metrics.record_attempt(AnalyzerKind::Document, ResultLabel::Timeout, Duration::from_secs(500));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.latency[0].buckets.last().map(|b| b.1), Some(0));
        assert_eq!(snapshot.latency[0].count, 1);
    }

    #[test]
    fn terminal_kind_maps_to_labels() {
        let exhausted = TerminalKind::RetriesExhausted {
            last: FailureKind::Timeout,
        };
        assert_eq!(ResultLabel::from(exhausted), ResultLabel::RetriesExhausted);
        assert_eq!(
            ResultLabel::from(TerminalKind::Failed(FailureKind::Fatal)),
            ResultLabel::Fatal
        );
    }

    #[test]
    fn prometheus_rendering_contains_labels() {
        let metrics = AtomicMetrics::new();
        metrics.record_attempt(AnalyzerKind::Document, ResultLabel::Timeout, Duration::from_millis(5));
        metrics.record_outcome(AnalyzerKind::Document, ResultLabel::RetriesExhausted);

        let text = metrics.render_prometheus();
        assert!(text.contains(
            "adapter_attempts_total{stage=\"perception\",analyzer=\"document\",result=\"timeout\"} 1"
        ));
        assert!(text.contains(
            "adapter_outcomes_total{stage=\"perception\",analyzer=\"document\",result=\"retries_exhausted\"} 1"
        ));
        assert!(text.contains("adapter_attempt_seconds_count{stage=\"perception\",analyzer=\"document\"} 1"));
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = AtomicMetrics::new();
        metrics.record_outcome(AnalyzerKind::Vision, ResultLabel::Fatal);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["outcomes"][0]["analyzer"], "vision");
        assert_eq!(json["outcomes"][0]["result"], "fatal");
    }
}
