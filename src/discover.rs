/// Result-file discovery: map `<results_dir>/<condition>/*.jsonl` into
/// (condition, task, run, path) tuples for the parser. The core pipeline
/// only ever sees the tuples, never the directory layout.
use std::path::{Path, PathBuf};

/// One result file located on disk, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRun {
    pub condition: String,
    pub task_id: String,
    pub run: String,
    pub path: PathBuf,
}

/// Find every result file for the given conditions, in condition order,
/// alphabetical within a condition. A missing condition directory simply
/// contributes nothing.
pub fn discover_runs(results_dir: &Path, conditions: &[String]) -> Vec<DiscoveredRun> {
    let mut found = Vec::new();

    for cond in conditions {
        let pattern = results_dir.join(cond).join("*.jsonl");
        let pattern = pattern.to_string_lossy();
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, pattern = %pattern, "bad discovery pattern");
                continue;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable path during discovery");
                    continue;
                }
            };
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            let (task_id, run) = split_run_label(stem);
            found.push(DiscoveredRun {
                condition: cond.clone(),
                task_id: task_id.to_string(),
                run: run.to_string(),
                path: path.clone(),
            });
        }
    }

    found
}

/// Split a file stem like "symbol-lookup_run2" on its last "_run" into
/// task id and run label. A stem without the suffix is run "1".
pub fn split_run_label(stem: &str) -> (&str, &str) {
    match stem.rsplit_once("_run") {
        Some((task, run)) => (task, run),
        None => (stem, "1"),
    }
}
