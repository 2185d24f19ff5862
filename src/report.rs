/// Comparative report rendering and summary JSON output.
///
/// Consumes only the aggregator's output contract; the summary file uses
/// the atomic write pattern (temp file then rename).
use crate::aggregate::{
    percent_delta, AggregateSummary, Batch, DispersionSummary, COST_EPSILON, COUNT_EPSILON,
    RATIO_EPSILON,
};
use crate::score::Task;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const RULE_WIDTH: usize = 100;

/// Per-condition pooled means, one row per condition.
pub fn render_summary_table(
    summaries: &BTreeMap<String, AggregateSummary>,
    labels: &BTreeMap<String, String>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "  RESULTS SUMMARY — per-condition averages");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<22} {:>4} {:>6} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>9} {:>8} {:>7} {:>8} {:>6}",
        "Condition", "Runs", "Tools", "Read", "Glob", "Grep", "Shell", "Probe", "Files", "Mnfst",
        "InTok", "OutTok", "Cost", "ms", "Score"
    );
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));

    for (key, s) in summaries {
        let label = condition_label(key, labels);
        let _ = writeln!(
            out,
            "{:<22} {:>4} {:>6.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5} {:>9.0} {:>8.0} {:>7} {:>8.0} {:>6}",
            label,
            s.n,
            s.tool_calls,
            s.read_calls,
            s.glob_calls,
            s.grep_calls,
            s.shell_calls,
            s.probe_calls,
            s.files_accessed,
            format!("{:.0}%", s.manifest_pct),
            s.input_tokens,
            s.output_tokens,
            format!("${:.2}", s.cost_usd),
            s.duration_ms,
            format!("{:.0}%", s.correctness * 100.0),
        );
    }
    out
}

/// Mean +/- sample stddev for the headline metrics.
pub fn render_dispersion_table(
    dispersion: &BTreeMap<String, DispersionSummary>,
    labels: &BTreeMap<String, String>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "  Mean ± stddev (sample, n-1)");
    let _ = writeln!(
        out,
        "  {:<22} {:>16} {:>16} {:>18} {:>20}",
        "Condition", "Tools", "Cost", "Duration", "InTok"
    );
    let _ = writeln!(out, "  {}", "-".repeat(94));

    for (key, d) in dispersion {
        let label = condition_label(key, labels);
        let _ = writeln!(
            out,
            "  {:<22} {:>7.1} ±{:>6.1} {:>8} ±{:>5.2} {:>9.1}s ±{:>6.1}s {:>11.0} ±{:>7.0}",
            label,
            d.tool_calls.mean,
            d.tool_calls.stddev,
            format!("${:.2}", d.cost_usd.mean),
            d.cost_usd.stddev,
            d.duration_ms.mean / 1000.0,
            d.duration_ms.stddev / 1000.0,
            d.input_tokens.mean,
            d.input_tokens.stddev,
        );
    }
    out
}

/// Per-task breakdown: every run with PASS/FAIL and a failed-answer preview.
pub fn render_task_breakdown(tasks: &BTreeMap<String, Task>, batch: &Batch) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "  PER-TASK BREAKDOWN");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));

    for (task_id, task) in tasks {
        let _ = writeln!(out);
        let _ = writeln!(out, "--- {task_id} ---");
        if !task.prompt.is_empty() {
            let _ = writeln!(out, "  Prompt: {}", preview(&task.prompt, 80));
        }

        for (condition, by_task) in batch {
            let runs = match by_task.get(task_id) {
                Some(runs) if !runs.is_empty() => runs,
                _ => {
                    let _ = writeln!(out, "  [{condition}] no results");
                    continue;
                }
            };
            for r in runs {
                let status = if r.passed() { "PASS" } else { "FAIL" };
                let _ = writeln!(
                    out,
                    "  [{condition}] {status} ({:.0}%) run {} | tools={} (read={}, glob={}, grep={}, shell={}, probe={}) | turns={} | tokens={} | cost=${:.4} | {:.1}s",
                    r.correctness * 100.0,
                    r.run,
                    r.metrics.tool_call_count,
                    r.metrics.read_calls,
                    r.metrics.glob_calls,
                    r.metrics.grep_calls,
                    r.metrics.shell_calls,
                    r.metrics.probe_calls,
                    r.metrics.num_turns,
                    thousands(r.metrics.total_tokens),
                    r.metrics.cost_usd,
                    r.metrics.duration_ms as f64 / 1000.0,
                );
                if !r.passed() {
                    let _ = writeln!(out, "       Answer: {}", preview(&r.metrics.final_text, 120));
                }
            }
        }
    }
    out
}

/// Baseline-vs-treatment delta table over the pooled means.
pub fn render_delta_table(
    baseline_key: &str,
    treatment_key: &str,
    baseline: &AggregateSummary,
    treatment: &AggregateSummary,
    labels: &BTreeMap<String, String>,
) -> String {
    let pct = |x: f64| format!("{:.0}%", x * 100.0);
    let one = |x: f64| format!("{x:.1}");
    let tok = |x: f64| format!("{x:.0}");
    let usd = |x: f64| format!("${x:.4}");
    let secs = |x: f64| format!("{:.1}s", x / 1000.0);

    type Fmt = fn(f64) -> String;
    let rows: [(&str, f64, f64, f64, Fmt); 9] = [
        ("Correctness", baseline.correctness, treatment.correctness, RATIO_EPSILON, pct),
        ("Turns (avg)", baseline.num_turns, treatment.num_turns, COUNT_EPSILON, one),
        ("Tool calls (avg)", baseline.tool_calls, treatment.tool_calls, COUNT_EPSILON, one),
        ("Read calls (avg)", baseline.read_calls, treatment.read_calls, COUNT_EPSILON, one),
        ("Files accessed (avg)", baseline.files_accessed, treatment.files_accessed, COUNT_EPSILON, one),
        ("Total tokens (avg)", baseline.total_tokens, treatment.total_tokens, COUNT_EPSILON, tok),
        ("Output tokens (avg)", baseline.output_tokens, treatment.output_tokens, COUNT_EPSILON, tok),
        ("Cost (avg)", baseline.cost_usd, treatment.cost_usd, COST_EPSILON, usd),
        ("Duration (avg)", baseline.duration_ms, treatment.duration_ms, COUNT_EPSILON, secs),
    ];

    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(
        out,
        "  AGGREGATE COMPARISON — {} vs {}",
        condition_label(baseline_key, labels),
        condition_label(treatment_key, labels)
    );
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<25} {:<20} {:<20} {:<10}",
        "Metric", "Baseline", "Treatment", "Δ"
    );
    let _ = writeln!(out, "{}", "-".repeat(80));

    for (label, base, treat, epsilon, fmt) in rows {
        let delta = percent_delta(base, treat, epsilon);
        let _ = writeln!(
            out,
            "{:<25} {:<20} {:<20} {:<10}",
            label,
            fmt(base),
            fmt(treat),
            format!("{delta:+.0}%"),
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<25} {:<20} {:<20}",
        "Manifest adoption",
        format!("{:.0}%", baseline.manifest_pct),
        format!("{:.0}%", treatment.manifest_pct),
    );
    out
}

fn condition_label(key: &str, labels: &BTreeMap<String, String>) -> String {
    match labels.get(key) {
        Some(label) if !label.is_empty() && label != key => format!("{key}: {label}"),
        _ => key.to_string(),
    }
}

/// First `limit` characters with newlines flattened.
fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).map(|c| if c == '\n' { ' ' } else { c }).collect()
}

fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// The summary JSON payload: the batch mapping plus a generation stamp.
#[derive(Serialize)]
struct Summary<'a> {
    generated_at: String,
    conditions: &'a Batch,
}

/// Atomically write the scored batch as pretty JSON.
///
/// Writes to a temporary file in the same directory, then renames so
/// readers never see a partial write.
pub fn write_summary_json(path: &Path, batch: &Batch) -> Result<(), ReportError> {
    let payload = Summary {
        generated_at: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        conditions: batch,
    };
    let json = serde_json::to_string_pretty(&payload)
        .map_err(|e| ReportError::Serialize { source: e })?;

    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp_path = dir.join(format!(".crucible.summary.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| ReportError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Errors from summary output.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => {
                write!(f, "failed to serialize summary: {source}")
            }
            ReportError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp summary file {}: {source}",
                    path.display()
                )
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{condition_dispersion, condition_summaries, insert_run};
    use crate::ingest::RunMetrics;
    use crate::score::{GroundTruth, ScoredRun, Scoring};
    use serde_json::Value;
    use tempfile::TempDir;

    fn scored(task_id: &str, run: &str, correctness: f64) -> ScoredRun {
        ScoredRun {
            metrics: RunMetrics {
                tool_call_count: 5,
                read_calls: 2,
                total_tokens: 1500,
                cost_usd: 0.0321,
                duration_ms: 12_300,
                ..Default::default()
            },
            task_id: task_id.to_string(),
            run: run.to_string(),
            correctness,
        }
    }

    fn sample_batch() -> Batch {
        let mut batch = Batch::new();
        insert_run(&mut batch, "A", scored("count", "1", 1.0));
        insert_run(&mut batch, "A", scored("count", "2", 0.0));
        insert_run(&mut batch, "B", scored("count", "1", 1.0));
        batch
    }

    fn labels() -> BTreeMap<String, String> {
        [("A", "vanilla"), ("B", "fmm")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample_tasks() -> BTreeMap<String, Task> {
        let task = Task {
            id: "count".to_string(),
            prompt: "How many routes are registered?".to_string(),
            scoring: Scoring::ExactNumber,
            ground_truth: Some(GroundTruth::Number(42)),
        };
        [("count".to_string(), task)].into_iter().collect()
    }

    #[test]
    fn summary_table_lists_every_condition() {
        let batch = sample_batch();
        let table = render_summary_table(&condition_summaries(&batch), &labels());
        assert!(table.contains("A: vanilla"));
        assert!(table.contains("B: fmm"));
        assert!(table.contains("RESULTS SUMMARY"));
    }

    #[test]
    fn dispersion_table_shows_mean_and_spread() {
        let batch = sample_batch();
        let table = render_dispersion_table(&condition_dispersion(&batch), &labels());
        assert!(table.contains("±"));
        assert!(table.contains("A: vanilla"));
    }

    #[test]
    fn breakdown_marks_pass_and_fail_with_preview() {
        let mut batch = sample_batch();
        batch.get_mut("A").unwrap().get_mut("count").unwrap()[1]
            .metrics
            .final_text = "something\nwrong".to_string();

        let text = render_task_breakdown(&sample_tasks(), &batch);
        assert!(text.contains("PASS (100%)"));
        assert!(text.contains("FAIL (0%)"));
        assert!(text.contains("Answer: something wrong"));
    }

    #[test]
    fn breakdown_notes_conditions_without_results() {
        let mut batch = Batch::new();
        insert_run(&mut batch, "A", scored("other-task", "1", 1.0));
        let text = render_task_breakdown(&sample_tasks(), &batch);
        assert!(text.contains("[A] no results"));
    }

    #[test]
    fn delta_table_reports_percentage_change() {
        let batch = sample_batch();
        let summaries = condition_summaries(&batch);
        let table = render_delta_table("A", "B", &summaries["A"], &summaries["B"], &labels());
        // correctness: 0.5 -> 1.0 is +100%
        assert!(table.contains("+100%"));
        assert!(table.contains("Manifest adoption"));
    }

    #[test]
    fn thousands_groups_digits() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn summary_json_is_atomic_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let batch = sample_batch();

        write_summary_json(&path, &batch).unwrap();

        let tmp = dir
            .path()
            .join(format!(".crucible.summary.tmp.{}", std::process::id()));
        assert!(!tmp.exists(), "temp file should be cleaned up by rename");

        let text = std::fs::read_to_string(&path).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert!(v.get("generated_at").is_some());

        let round_tripped: Batch =
            serde_json::from_value(v.get("conditions").unwrap().clone()).unwrap();
        assert_eq!(round_tripped["A"]["count"].len(), 2);
        assert_eq!(round_tripped["A"]["count"][0].metrics.tool_call_count, 5);

        // BTreeMap keys serialize in sorted order
        let conditions: Vec<&String> =
            round_tripped.keys().collect();
        assert_eq!(conditions, ["A", "B"]);
    }

    #[test]
    fn summary_json_exposes_files_count_not_the_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let mut batch = Batch::new();
        let mut r = scored("count", "1", 1.0);
        r.metrics.files_accessed = 3;
        insert_run(&mut batch, "A", r);

        write_summary_json(&path, &batch).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let run = &v["conditions"]["A"]["count"][0];
        assert_eq!(run["files_accessed"], 3);
        assert!(run["files_accessed"].is_number());
    }
}
