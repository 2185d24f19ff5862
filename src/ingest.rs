/// Stream-json metric extraction: parse one agent session log into one
/// immutable RunMetrics record.
use crate::classify::{self, ManifestRules, ToolCategory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

/// Extracted metrics from one session stream.
///
/// The distinct-files set itself never leaves the parser; only its
/// cardinality is recorded here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tool_call_count: u64,
    pub read_calls: u64,
    pub glob_calls: u64,
    pub grep_calls: u64,
    pub shell_calls: u64,
    pub probe_calls: u64,
    pub other_calls: u64,
    pub files_accessed: u64,
    pub manifest_accessed: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u64,
    pub final_text: String,
    pub mcp_servers: Vec<String>,
    pub skills: Vec<String>,
}

/// Running state while walking one stream; collapsed into a RunMetrics
/// by `finish`. Assistant usage deltas and terminal-record totals are
/// kept apart until then so the merge never double-counts.
#[derive(Default)]
struct Accumulator {
    tool_call_count: u64,
    read_calls: u64,
    glob_calls: u64,
    grep_calls: u64,
    shell_calls: u64,
    probe_calls: u64,
    other_calls: u64,
    files: HashSet<String>,
    manifest_accessed: bool,
    delta_input: u64,
    delta_output: u64,
    delta_cache_read: u64,
    delta_cache_creation: u64,
    result_input: u64,
    result_output: u64,
    result_cache_read: u64,
    result_cache_creation: u64,
    result_duration_ms: u64,
    meta_duration_ms: u64,
    cost_usd: f64,
    num_turns: u64,
    assistant_text: String,
    result_text: String,
    mcp_servers: Vec<String>,
    skills: Vec<String>,
}

impl Accumulator {
    fn record_event(&mut self, v: &Value, rules: &ManifestRules) {
        // Harness-appended metadata rides alongside the typed records.
        if let Some(meta) = v.get("_meta") {
            self.meta_duration_ms = u64_field(meta, "duration_ms");
            return;
        }

        match v.get("type").and_then(|t| t.as_str()) {
            Some("system") if v.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
                self.system_init(v)
            }
            Some("assistant") => self.assistant(v, rules),
            Some("user") => self.user(v, rules),
            Some("result") => self.result(v),
            _ => {}
        }
    }

    fn system_init(&mut self, v: &Value) {
        if let Some(servers) = v.get("mcp_servers").and_then(|s| s.as_array()) {
            self.mcp_servers = servers
                .iter()
                .filter_map(|s| s.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect();
        }
        if let Some(skills) = v.get("skills").and_then(|s| s.as_array()) {
            self.skills = skills
                .iter()
                .filter_map(|s| s.as_str())
                .map(str::to_string)
                .collect();
        }
    }

    fn assistant(&mut self, v: &Value, rules: &ManifestRules) {
        let msg = v.get("message");

        if let Some(content) = msg.and_then(|m| m.get("content")).and_then(|c| c.as_array()) {
            for block in content {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        // Later text blocks overwrite earlier ones; the last
                        // one standing is the candidate final answer.
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            self.assistant_text = text.to_string();
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("");
                        self.tool_use(name, block.get("input"), rules);
                    }
                    _ => {}
                }
            }
        }

        // Incremental usage delta for this message.
        if let Some(usage) = msg.and_then(|m| m.get("usage")) {
            self.delta_input += u64_field(usage, "input_tokens");
            self.delta_output += u64_field(usage, "output_tokens");
            self.delta_cache_read += u64_field(usage, "cache_read_input_tokens");
            self.delta_cache_creation += u64_field(usage, "cache_creation_input_tokens");
        }
    }

    fn tool_use(&mut self, name: &str, input: Option<&Value>, rules: &ManifestRules) {
        self.tool_call_count += 1;

        match classify::classify(name, rules) {
            ToolCategory::Read => {
                self.read_calls += 1;
                let path = input
                    .and_then(|i| i.get("file_path"))
                    .and_then(|p| p.as_str())
                    .or_else(|| input.and_then(|i| i.get("path")).and_then(|p| p.as_str()));
                if let Some(path) = path {
                    if !path.is_empty() {
                        self.files.insert(path.to_string());
                    }
                }
            }
            ToolCategory::Glob => self.glob_calls += 1,
            ToolCategory::Grep => self.grep_calls += 1,
            ToolCategory::Shell => {
                self.shell_calls += 1;
                let cmd = input
                    .and_then(|i| i.get("command"))
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                if let Some(pseudo) = classify::shell_pseudo_path(cmd) {
                    self.files.insert(pseudo);
                }
            }
            ToolCategory::ManifestProbe => {
                self.probe_calls += 1;
                if rules.probe_reads_manifest(name) {
                    self.manifest_accessed = true;
                }
            }
            ToolCategory::Other => self.other_calls += 1,
        }

        if let Some(input) = input {
            if rules.value_mentions_manifest(input) {
                self.manifest_accessed = true;
            }
        }
    }

    fn user(&mut self, v: &Value, rules: &ManifestRules) {
        let content = match v
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        {
            Some(arr) => arr,
            None => return,
        };

        for block in content {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                if let Some(result) = block.get("content") {
                    if rules.value_mentions_manifest(result) {
                        self.manifest_accessed = true;
                    }
                }
            }
        }
    }

    fn result(&mut self, v: &Value) {
        if let Some(dur) = v.get("duration_ms").and_then(|d| d.as_u64()) {
            self.result_duration_ms = dur;
        }
        if let Some(turns) = v.get("num_turns").and_then(|t| t.as_u64()) {
            self.num_turns = turns;
        }
        if let Some(cost) = v.get("total_cost_usd").and_then(|c| c.as_f64()) {
            self.cost_usd = cost;
        }
        if let Some(text) = v.get("result").and_then(|r| r.as_str()) {
            if !text.is_empty() {
                self.result_text = text.to_string();
            }
        }
        if let Some(usage) = v.get("usage") {
            self.result_input = u64_field(usage, "input_tokens");
            self.result_output = u64_field(usage, "output_tokens");
            self.result_cache_read = u64_field(usage, "cache_read_input_tokens");
            self.result_cache_creation = u64_field(usage, "cache_creation_input_tokens");
        }
    }

    fn finish(self, rules: &ManifestRules) -> RunMetrics {
        // Terminal-record totals win per field when non-zero; otherwise the
        // accumulated assistant deltas stand.
        let input_tokens = prefer(self.result_input, self.delta_input);
        let output_tokens = prefer(self.result_output, self.delta_output);
        let cache_read_tokens = prefer(self.result_cache_read, self.delta_cache_read);
        let cache_creation_tokens = prefer(self.result_cache_creation, self.delta_cache_creation);

        let duration_ms = if self.result_duration_ms > 0 {
            self.result_duration_ms
        } else {
            self.meta_duration_ms
        };

        let final_text = if self.result_text.is_empty() {
            self.assistant_text
        } else {
            self.result_text
        };

        let manifest_accessed = self.manifest_accessed || rules.text_mentions_manifest(&final_text);

        RunMetrics {
            tool_call_count: self.tool_call_count,
            read_calls: self.read_calls,
            glob_calls: self.glob_calls,
            grep_calls: self.grep_calls,
            shell_calls: self.shell_calls,
            probe_calls: self.probe_calls,
            other_calls: self.other_calls,
            files_accessed: self.files.len() as u64,
            manifest_accessed,
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_creation_tokens,
            total_tokens: input_tokens + output_tokens + cache_read_tokens + cache_creation_tokens,
            cost_usd: self.cost_usd,
            duration_ms,
            num_turns: self.num_turns,
            final_text,
            mcp_servers: self.mcp_servers,
            skills: self.skills,
        }
    }
}

fn u64_field(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(|x| x.as_u64()).unwrap_or(0)
}

fn prefer(result: u64, delta: u64) -> u64 {
    if result > 0 {
        result
    } else {
        delta
    }
}

/// Parse one ordered stream of JSON records into a RunMetrics.
///
/// Exactly one record is produced per stream. Lines that fail JSON
/// decoding are skipped without aborting the run.
pub fn parse_stream<R: BufRead>(reader: R, rules: &ManifestRules) -> RunMetrics {
    let mut acc = Accumulator::default();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            // A non-UTF-8 line is a bad record; a real I/O error ends the stream.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue, // skip malformed lines
        };
        acc.record_event(&v, rules);
    }

    acc.finish(rules)
}

/// Parse a stream-json file into a RunMetrics.
pub fn parse_file(path: &Path, rules: &ManifestRules) -> std::io::Result<RunMetrics> {
    let file = std::fs::File::open(path)?;
    Ok(parse_stream(std::io::BufReader::new(file), rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn parse_lines(lines: &[&str]) -> RunMetrics {
        parse_stream(lines.join("\n").as_bytes(), &ManifestRules::default())
    }

    fn write_jsonl(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join("test-run.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn empty_stream_yields_default_metrics() {
        let m = parse_lines(&[]);
        assert_eq!(m, RunMetrics::default());
    }

    #[test]
    fn single_read_then_result() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a/b.ts"}}]}}"#,
            r#"{"type":"result","total_cost_usd":0.02,"usage":{"input_tokens":100,"output_tokens":50}}"#,
        ]);
        assert_eq!(m.tool_call_count, 1);
        assert_eq!(m.read_calls, 1);
        assert_eq!(m.files_accessed, 1);
        assert!((m.cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(m.total_tokens, 150);
    }

    #[test]
    fn tool_count_equals_blocks_regardless_of_classification() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{}},{"type":"tool_use","name":"Edit","input":{}},{"type":"tool_use","name":"SomethingNew","input":{}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Grep","input":{}}]}}"#,
        ]);
        assert_eq!(m.tool_call_count, 4);
        assert_eq!(m.other_calls, 2);
    }

    #[test]
    fn category_counts_sum_to_total() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a"}},{"type":"tool_use","name":"Glob","input":{}},{"type":"tool_use","name":"Grep","input":{}},{"type":"tool_use","name":"Bash","input":{"command":"ls"}},{"type":"tool_use","name":"fmm_search","input":{}},{"type":"tool_use","name":"Write","input":{}}]}}"#,
        ]);
        let sum = m.read_calls
            + m.glob_calls
            + m.grep_calls
            + m.shell_calls
            + m.probe_calls
            + m.other_calls;
        assert_eq!(m.tool_call_count, 6);
        assert_eq!(sum, m.tool_call_count);
    }

    #[test]
    fn result_usage_overrides_accumulated_deltas() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":100,"cache_creation_input_tokens":20}}}"#,
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":100,"cache_creation_input_tokens":20}}}"#,
            r#"{"type":"result","usage":{"input_tokens":300,"output_tokens":80,"cache_read_input_tokens":900,"cache_creation_input_tokens":70}}"#,
        ]);
        assert_eq!(m.input_tokens, 300);
        assert_eq!(m.output_tokens, 80);
        assert_eq!(m.cache_read_tokens, 900);
        assert_eq!(m.cache_creation_tokens, 70);
        assert_eq!(m.total_tokens, 300 + 80 + 900 + 70);
    }

    #[test]
    fn zero_result_field_falls_back_to_deltas_per_field() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":40,"output_tokens":7}}}"#,
            r#"{"type":"result","usage":{"input_tokens":500,"output_tokens":0}}"#,
        ]);
        assert_eq!(m.input_tokens, 500);
        assert_eq!(m.output_tokens, 7); // delta stands where the result reports zero
    }

    #[test]
    fn missing_result_record_uses_deltas_and_zero_cost() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}],"usage":{"input_tokens":25,"output_tokens":12}}}"#,
        ]);
        assert_eq!(m.input_tokens, 25);
        assert_eq!(m.output_tokens, 12);
        assert_eq!(m.cost_usd, 0.0);
        assert_eq!(m.final_text, "partial");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let m = parse_lines(&[
            "not valid json",
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/x"}}]}}"#,
            "{broken",
            "",
        ]);
        assert_eq!(m.tool_call_count, 1);
    }

    #[test]
    fn meta_duration_used_when_result_has_none() {
        let m = parse_lines(&[
            r#"{"_meta":{"duration_ms":4200}}"#,
            r#"{"type":"result","total_cost_usd":0.1}"#,
        ]);
        assert_eq!(m.duration_ms, 4200);
    }

    #[test]
    fn result_duration_overrides_meta() {
        let m = parse_lines(&[
            r#"{"_meta":{"duration_ms":4200}}"#,
            r#"{"type":"result","duration_ms":9000,"num_turns":12}"#,
        ]);
        assert_eq!(m.duration_ms, 9000);
        assert_eq!(m.num_turns, 12);
    }

    #[test]
    fn manifest_detected_in_tool_input() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/repo/.fmm/index.json"}}]}}"#,
        ]);
        assert!(m.manifest_accessed);
    }

    #[test]
    fn manifest_detected_in_tool_result() {
        let m = parse_lines(&[
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"contents of .fmm/index.json follow"}]}}"#,
        ]);
        assert!(m.manifest_accessed);
    }

    #[test]
    fn manifest_detected_via_probe_name_keyword() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"mcp__fmm__get_manifest","input":{}}]}}"#,
        ]);
        assert!(m.manifest_accessed);
        assert_eq!(m.probe_calls, 1);
    }

    #[test]
    fn probe_without_keyword_does_not_set_manifest() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"fmm_search","input":{"query":"foo"}}]}}"#,
        ]);
        assert!(!m.manifest_accessed);
        assert_eq!(m.probe_calls, 1);
    }

    #[test]
    fn manifest_detected_in_final_answer() {
        let m = parse_lines(&[
            r#"{"type":"result","result":"I found the answer in .fmm/index.json"}"#,
        ]);
        assert!(m.manifest_accessed);
    }

    #[test]
    fn manifest_flag_is_monotonic() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/repo/.fmm/index.json"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/repo/src/lib.rs"}}]}}"#,
            r#"{"type":"result","result":"done"}"#,
        ]);
        assert!(m.manifest_accessed);
    }

    #[test]
    fn later_text_block_overwrites_earlier() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking..."}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"the answer is src/app.ts"}]}}"#,
        ]);
        assert_eq!(m.final_text, "the answer is src/app.ts");
    }

    #[test]
    fn result_text_wins_over_assistant_text() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}]}}"#,
            r#"{"type":"result","result":"final answer"}"#,
        ]);
        assert_eq!(m.final_text, "final answer");
    }

    #[test]
    fn empty_result_text_falls_back_to_assistant_text() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}]}}"#,
            r#"{"type":"result","result":""}"#,
        ]);
        assert_eq!(m.final_text, "draft");
    }

    #[test]
    fn init_record_captures_servers_and_skills() {
        let m = parse_lines(&[
            r#"{"type":"system","subtype":"init","mcp_servers":[{"name":"fmm","status":"connected"}],"skills":["lookup","summarize"]}"#,
        ]);
        assert_eq!(m.mcp_servers, vec!["fmm"]);
        assert_eq!(m.skills, vec!["lookup", "summarize"]);
    }

    #[test]
    fn shell_read_command_joins_files_set() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"cat src/main.rs"}},{"type":"tool_use","name":"Bash","input":{"command":"cargo build"}}]}}"#,
        ]);
        assert_eq!(m.shell_calls, 2);
        assert_eq!(m.files_accessed, 1);
    }

    #[test]
    fn repeated_reads_of_same_path_count_once() {
        let m = parse_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a"}},{"type":"tool_use","name":"Read","input":{"file_path":"/a"}},{"type":"tool_use","name":"Read","input":{"file_path":"/b"}}]}}"#,
        ]);
        assert_eq!(m.read_calls, 3);
        assert_eq!(m.files_accessed, 2);
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = write_jsonl(
            dir.path(),
            &[
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Grep","input":{"pattern":"foo"}}]}}"#,
                r#"{"type":"result","duration_ms":1500,"total_cost_usd":0.01,"usage":{"input_tokens":10,"output_tokens":3}}"#,
            ],
        );
        let m = parse_file(&path, &ManifestRules::default()).unwrap();
        assert_eq!(m.grep_calls, 1);
        assert_eq!(m.duration_ms, 1500);
    }

    #[test]
    fn parse_file_not_found_is_an_error() {
        let result = parse_file(Path::new("/nonexistent/run.jsonl"), &ManifestRules::default());
        assert!(result.is_err());
    }
}
