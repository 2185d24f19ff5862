/// Grouping and statistics: pool scored runs by condition, compute
/// per-condition means, manifest-adoption rates, dispersion, and
/// baseline-vs-treatment deltas.
///
/// Aggregates are derived values, recomputed from scratch on every
/// invocation.
use crate::score::ScoredRun;
use serde::Serialize;
use std::collections::BTreeMap;

/// The output contract mapping: condition label -> task id -> ordered runs.
/// BTreeMaps keep serialization deterministic.
pub type Batch = BTreeMap<String, BTreeMap<String, Vec<ScoredRun>>>;

/// Add a scored run to the batch under its condition and task id.
pub fn insert_run(batch: &mut Batch, condition: &str, run: ScoredRun) {
    batch
        .entry(condition.to_string())
        .or_default()
        .entry(run.task_id.clone())
        .or_default()
        .push(run);
}

/// Division guard for count-like metrics (tool calls, tokens, duration).
pub const COUNT_EPSILON: f64 = 1.0;
/// Division guard for currency metrics.
pub const COST_EPSILON: f64 = 0.01;
/// Division guard for [0,1] ratios like correctness.
pub const RATIO_EPSILON: f64 = 0.01;

/// Per-condition arithmetic means pooled across all tasks and runs.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSummary {
    pub n: usize,
    pub tool_calls: f64,
    pub read_calls: f64,
    pub glob_calls: f64,
    pub grep_calls: f64,
    pub shell_calls: f64,
    pub probe_calls: f64,
    pub other_calls: f64,
    pub files_accessed: f64,
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub cache_read_tokens: f64,
    pub cache_creation_tokens: f64,
    pub total_tokens: f64,
    pub cost_usd: f64,
    pub duration_ms: f64,
    pub num_turns: f64,
    pub correctness: f64,
    pub manifest_pct: f64,
}

impl AggregateSummary {
    /// Pool runs into means. Returns None for an empty group.
    pub fn from_runs(runs: &[&ScoredRun]) -> Option<Self> {
        if runs.is_empty() {
            return None;
        }
        let n = runs.len();
        let mean = |f: &dyn Fn(&ScoredRun) -> f64| runs.iter().map(|r| f(r)).sum::<f64>() / n as f64;
        let manifest_hits = runs.iter().filter(|r| r.metrics.manifest_accessed).count();

        Some(Self {
            n,
            tool_calls: mean(&|r| r.metrics.tool_call_count as f64),
            read_calls: mean(&|r| r.metrics.read_calls as f64),
            glob_calls: mean(&|r| r.metrics.glob_calls as f64),
            grep_calls: mean(&|r| r.metrics.grep_calls as f64),
            shell_calls: mean(&|r| r.metrics.shell_calls as f64),
            probe_calls: mean(&|r| r.metrics.probe_calls as f64),
            other_calls: mean(&|r| r.metrics.other_calls as f64),
            files_accessed: mean(&|r| r.metrics.files_accessed as f64),
            input_tokens: mean(&|r| r.metrics.input_tokens as f64),
            output_tokens: mean(&|r| r.metrics.output_tokens as f64),
            cache_read_tokens: mean(&|r| r.metrics.cache_read_tokens as f64),
            cache_creation_tokens: mean(&|r| r.metrics.cache_creation_tokens as f64),
            total_tokens: mean(&|r| r.metrics.total_tokens as f64),
            cost_usd: mean(&|r| r.metrics.cost_usd),
            duration_ms: mean(&|r| r.metrics.duration_ms as f64),
            num_turns: mean(&|r| r.metrics.num_turns as f64),
            correctness: mean(&|r| r.correctness),
            manifest_pct: manifest_hits as f64 / n as f64 * 100.0,
        })
    }
}

/// Mean and sample standard deviation for one metric.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricStats {
    pub mean: f64,
    pub stddev: f64,
    pub n: usize,
}

impl MetricStats {
    fn from_values(values: &[f64]) -> Self {
        let n = values.len();
        let mean = if n == 0 {
            0.0
        } else {
            values.iter().sum::<f64>() / n as f64
        };
        Self {
            mean,
            stddev: stddev(values),
            n,
        }
    }
}

/// Mean +/- stddev for the headline metrics of one condition.
#[derive(Debug, Clone, Serialize)]
pub struct DispersionSummary {
    pub tool_calls: MetricStats,
    pub cost_usd: MetricStats,
    pub duration_ms: MetricStats,
    pub input_tokens: MetricStats,
}

impl DispersionSummary {
    pub fn from_runs(runs: &[&ScoredRun]) -> Option<Self> {
        if runs.is_empty() {
            return None;
        }
        let values = |f: &dyn Fn(&ScoredRun) -> f64| -> Vec<f64> {
            runs.iter().map(|r| f(r)).collect()
        };
        Some(Self {
            tool_calls: MetricStats::from_values(&values(&|r| r.metrics.tool_call_count as f64)),
            cost_usd: MetricStats::from_values(&values(&|r| r.metrics.cost_usd)),
            duration_ms: MetricStats::from_values(&values(&|r| r.metrics.duration_ms as f64)),
            input_tokens: MetricStats::from_values(&values(&|r| r.metrics.input_tokens as f64)),
        })
    }
}

/// All runs of a condition, pooled across tasks, in task order.
fn pooled_runs<'a>(tasks: &'a BTreeMap<String, Vec<ScoredRun>>) -> Vec<&'a ScoredRun> {
    tasks.values().flatten().collect()
}

/// Per-condition pooled means for every condition in the batch.
pub fn condition_summaries(batch: &Batch) -> BTreeMap<String, AggregateSummary> {
    batch
        .iter()
        .filter_map(|(cond, tasks)| {
            AggregateSummary::from_runs(&pooled_runs(tasks)).map(|s| (cond.clone(), s))
        })
        .collect()
}

/// Per-condition dispersion stats for every condition in the batch.
pub fn condition_dispersion(batch: &Batch) -> BTreeMap<String, DispersionSummary> {
    batch
        .iter()
        .filter_map(|(cond, tasks)| {
            DispersionSummary::from_runs(&pooled_runs(tasks)).map(|s| (cond.clone(), s))
        })
        .collect()
}

/// Sample standard deviation (Bessel's correction); 0.0 when n < 2.
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Percentage change from baseline to treatment. The epsilon floor on the
/// denominator keeps zero and near-zero baselines from blowing up.
pub fn percent_delta(baseline: f64, treatment: f64, epsilon: f64) -> f64 {
    (treatment - baseline) / baseline.max(epsilon) * 100.0
}
