/// Tool-call classification and manifest-detection heuristics.
///
/// Every tool_use block lands in exactly one category; names outside the
/// recognized set bucket as Other rather than erroring. Manifest detection
/// is a best-effort substring signal over serialized tool inputs and free
/// text, not proof the agent's reasoning consumed the manifest.
use serde::Serialize;
use serde_json::Value;

/// Closed set of semantic buckets for tool invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Glob,
    Grep,
    Shell,
    ManifestProbe,
    Other,
}

/// Shell verbs that indicate a command is reading file contents.
const READ_VERBS: [&str; 4] = ["cat ", "head ", "tail ", "less "];

/// Command prefix length kept when recording a shell pseudo-path.
const SHELL_PSEUDO_PATH_LEN: usize = 100;

/// Detection rules for the auxiliary manifest artifact.
///
/// The marker is matched as a plain substring. A probe tool name counts
/// as manifest access only when it both carries a reserved prefix and
/// mentions one of the probe keywords.
#[derive(Debug, Clone)]
pub struct ManifestRules {
    /// Substring that identifies the manifest artifact in a path or text.
    pub marker: String,
    /// Tool-name prefixes reserved for manifest tooling.
    pub probe_prefixes: Vec<String>,
    /// Keywords a probe name must also carry to count as manifest access.
    pub probe_keywords: Vec<String>,
}

impl Default for ManifestRules {
    fn default() -> Self {
        Self {
            marker: ".fmm/index.json".to_string(),
            probe_prefixes: vec!["mcp__fmm__".to_string(), "fmm_".to_string()],
            probe_keywords: vec!["manifest".to_string(), "index".to_string()],
        }
    }
}

impl ManifestRules {
    /// True if the tool name carries a reserved manifest-tool prefix.
    pub fn is_probe(&self, name: &str) -> bool {
        self.probe_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// True if a probe name also mentions a manifest keyword.
    pub fn probe_reads_manifest(&self, name: &str) -> bool {
        if !self.is_probe(name) {
            return false;
        }
        let lower = name.to_lowercase();
        self.probe_keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Scan a serialized JSON value (tool input or tool result) for the marker.
    pub fn value_mentions_manifest(&self, value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(serialized) => serialized.contains(&self.marker),
            Err(_) => false,
        }
    }

    /// Scan free text (answer text, string tool results) for the marker.
    pub fn text_mentions_manifest(&self, text: &str) -> bool {
        text.contains(&self.marker)
    }
}

/// Classify a tool name into exactly one category.
///
/// Exact built-in names win over prefix rules; `View` is the legacy alias
/// for `Read` still seen in older streams.
pub fn classify(name: &str, rules: &ManifestRules) -> ToolCategory {
    match name {
        "Read" | "View" => ToolCategory::Read,
        "Glob" => ToolCategory::Glob,
        "Grep" => ToolCategory::Grep,
        "Bash" => ToolCategory::Shell,
        _ if rules.is_probe(name) => ToolCategory::ManifestProbe,
        _ => ToolCategory::Other,
    }
}

/// Pseudo-path for a shell command that reads file contents.
///
/// Scans for a fixed set of read-like verbs; on a hit the truncated
/// command stands in for the file it paged through. Not a shell parser.
pub fn shell_pseudo_path(command: &str) -> Option<String> {
    if READ_VERBS.iter().any(|v| command.contains(v)) {
        let head: String = command.chars().take(SHELL_PSEUDO_PATH_LEN).collect();
        Some(format!("(shell) {head}"))
    } else {
        None
    }
}
