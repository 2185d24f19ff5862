/// Correctness scoring: compare a run's final answer against a task's
/// ground truth using the task's declared strategy.
use crate::ingest::RunMetrics;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Whole-number tokens, matched on word boundaries.
static NUMBER_TOKENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").unwrap());

/// Correctness at or above this counts as a pass.
pub const PASS_THRESHOLD: f64 = 0.8;

/// Scoring strategy tags from the task specification. Unrecognized tags
/// land on Unknown and score 0.0 rather than failing the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Scoring {
    ExactPath,
    SetMatch,
    ExactNumber,
    Unknown,
}

impl From<String> for Scoring {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "exact_path" => Scoring::ExactPath,
            "set_match" => Scoring::SetMatch,
            "exact_number" => Scoring::ExactNumber,
            _ => Scoring::Unknown,
        }
    }
}

/// Expected value for a task; its shape depends on the strategy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GroundTruth {
    Path(String),
    Set(Vec<String>),
    Number(i64),
}

/// Static ground-truth specification for one task.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    pub scoring: Scoring,
    #[serde(default)]
    pub ground_truth: Option<GroundTruth>,
}

/// One run's metrics paired with its task and correctness score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRun {
    #[serde(flatten)]
    pub metrics: RunMetrics,
    pub task_id: String,
    pub run: String,
    pub correctness: f64,
}

impl ScoredRun {
    /// Score a run's final answer against its task.
    pub fn new(metrics: RunMetrics, task: &Task, run: impl Into<String>) -> Self {
        let correctness = score_answer(&metrics.final_text, task);
        Self {
            task_id: task.id.clone(),
            run: run.into(),
            correctness,
            metrics,
        }
    }

    pub fn passed(&self) -> bool {
        self.correctness >= PASS_THRESHOLD
    }
}

/// Score an answer against a task's ground truth.
///
/// An unknown strategy, or a ground-truth shape that does not fit the
/// declared strategy, scores 0.0. A set_match task with no ground truth
/// is vacuously satisfied.
pub fn score_answer(answer: &str, task: &Task) -> f64 {
    match task.scoring {
        Scoring::ExactPath => match &task.ground_truth {
            Some(GroundTruth::Path(truth)) => score_exact_path(answer, truth),
            _ => 0.0,
        },
        Scoring::SetMatch => match &task.ground_truth {
            Some(GroundTruth::Set(items)) => score_set_match(answer, items),
            None => 1.0,
            _ => 0.0,
        },
        Scoring::ExactNumber => match &task.ground_truth {
            Some(GroundTruth::Number(truth)) => score_exact_number(answer, &truth.to_string()),
            Some(GroundTruth::Path(truth)) => score_exact_number(answer, truth.trim()),
            _ => 0.0,
        },
        Scoring::Unknown => 0.0,
    }
}

/// 1.0 if the normalized truth appears in the normalized answer.
pub fn score_exact_path(answer: &str, truth: &str) -> f64 {
    if normalize_path(answer).contains(normalize_path(truth)) {
        1.0
    } else {
        0.0
    }
}

/// Strip whitespace, surrounding backticks, and one leading `./`.
fn normalize_path(s: &str) -> &str {
    let s = s.trim().trim_matches('`').trim();
    s.strip_prefix("./").unwrap_or(s)
}

/// Fraction of expected filename stems found in the answer,
/// case-insensitively. An empty expected set scores 1.0.
pub fn score_set_match(answer: &str, truth: &[String]) -> f64 {
    if truth.is_empty() {
        return 1.0;
    }
    let answer_lower = answer.to_lowercase();
    let found = truth
        .iter()
        .filter(|item| answer_lower.contains(&file_stem(item).to_lowercase()))
        .count();
    found as f64 / truth.len() as f64
}

/// Basename of a path-like item with a source-file extension removed.
fn file_stem(item: &str) -> &str {
    let base = item.rsplit('/').next().unwrap_or(item);
    base.strip_suffix(".js")
        .or_else(|| base.strip_suffix(".ts"))
        .unwrap_or(base)
}

/// 1.0 if the truth's string form is among the answer's number tokens.
pub fn score_exact_number(answer: &str, truth: &str) -> f64 {
    if NUMBER_TOKENS.find_iter(answer).any(|m| m.as_str() == truth) {
        1.0
    } else {
        0.0
    }
}

/// Task specification file: an ordered list of tasks under a "tasks" key.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Load the task specification, keyed by task id.
pub fn load_tasks(path: &Path) -> Result<BTreeMap<String, Task>, TaskError> {
    let text = std::fs::read_to_string(path).map_err(|e| TaskError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let file: TaskFile = serde_json::from_str(&text).map_err(|e| TaskError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(file
        .tasks
        .into_iter()
        .map(|t| (t.id.clone(), t))
        .collect())
}

/// Errors from loading the task specification.
#[derive(Debug)]
pub enum TaskError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Io { path, source } => {
                write!(f, "failed to read tasks file {}: {source}", path.display())
            }
            TaskError::Parse { path, source } => {
                write!(f, "failed to parse tasks file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Io { source, .. } => Some(source),
            TaskError::Parse { source, .. } => Some(source),
        }
    }
}
