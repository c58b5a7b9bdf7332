//! Source-code review capabilities and the review workflow built from them.
//!
//! Analysis is line oriented: function and type declarations are found with
//! regular expressions that cover Python, Rust and JavaScript-style sources,
//! and complexity is one plus the number of decision keywords in a body.
//! The tools read the source text from `state.code`.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use flowgraph_types::{FlowError, Result, RunState};

use crate::definition::{Config, GraphDefinition, NodeSpec};
use crate::registry::{Capability, CapabilityRegistry, StepOutput};

/// Lines longer than this are reported as `line_too_long`.
pub const MAX_LINE_LENGTH: usize = 100;

pub const DEFAULT_COMPLEXITY_THRESHOLD: u64 = 10;
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 70.0;
pub const DEFAULT_REVIEW_ITERATIONS: u32 = 5;

const CODE_KEY: &str = "code";
const DEBUG_PREFIXES: &[&str] = &["print(", "println!(", "eprintln!(", "dbg!(", "console.log("];

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// A declared function as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub line_number: usize,
    pub args: Vec<String>,
    pub has_docstring: bool,
    #[serde(skip)]
    pub complexity: u64,
}

/// A declared class, struct, enum or trait.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub name: String,
    pub line_number: usize,
    pub has_docstring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub line: usize,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

/// Compiled declaration and decision-point patterns, shared by the tools.
#[derive(Debug)]
pub struct SourceScanner {
    function: Regex,
    type_decl: Regex,
    decision: Regex,
}

fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| FlowError::Other(format!("invalid scanner pattern: {e}")))
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

fn arg_name(raw: &str) -> Option<String> {
    let head = raw.split(|c: char| c == ':' || c == '=').next()?.trim();
    let head = head.trim_start_matches(|c: char| c == '&' || c == '*');
    let head = head.strip_prefix("mut ").unwrap_or(head).trim();
    let is_ident = !head.is_empty() && head.chars().all(|c| c.is_alphanumeric() || c == '_');
    is_ident.then(|| head.to_string())
}

impl SourceScanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            function: pattern(
                r"^\s*(?:(?:pub(?:\([^)]*\))?|async|const|unsafe|static|export|extern)\s+)*(?:def|fn|function)\s+(?P<name>[A-Za-z_]\w*)\s*(?:<[^>]*>)?\s*\((?P<args>[^)]*)",
            )?,
            type_decl: pattern(
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:class|struct|enum|trait)\s+(?P<name>[A-Za-z_]\w*)",
            )?,
            decision: pattern(r"\b(?:if|elif|for|while|except|catch|case|and|or)\b|&&|\|\|")?,
        })
    }

    pub fn functions(&self, code: &str) -> Vec<FunctionInfo> {
        let lines: Vec<&str> = code.lines().collect();
        let starts: Vec<usize> = (0..lines.len())
            .filter(|&i| self.function.is_match(lines[i]))
            .collect();

        starts
            .iter()
            .enumerate()
            .filter_map(|(n, &idx)| {
                let caps = self.function.captures(lines[idx])?;
                let body_end = starts.get(n + 1).copied().unwrap_or(lines.len());
                let args: Vec<String> = caps
                    .name("args")
                    .map(|m| m.as_str().split(',').filter_map(arg_name).collect())
                    .unwrap_or_default();
                Some(FunctionInfo {
                    name: caps["name"].to_string(),
                    line_number: idx + 1,
                    args,
                    has_docstring: has_doc(&lines, idx),
                    complexity: 1 + self.decision_points(&lines[idx + 1..body_end]),
                })
            })
            .collect()
    }

    pub fn types(&self, code: &str) -> Vec<TypeInfo> {
        let lines: Vec<&str> = code.lines().collect();
        lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| {
                let caps = self.type_decl.captures(line)?;
                Some(TypeInfo {
                    name: caps["name"].to_string(),
                    line_number: idx + 1,
                    has_docstring: has_doc(&lines, idx),
                })
            })
            .collect()
    }

    fn decision_points(&self, body: &[&str]) -> u64 {
        body.iter()
            .filter(|line| !is_comment(line.trim_start()))
            .map(|line| self.decision.find_iter(line).count() as u64)
            .sum()
    }

    pub fn issues(&self, code: &str) -> Vec<Issue> {
        let mut issues = Vec::new();

        for (idx, line) in code.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = line.trim();
            let length = line.chars().count();
            if length > MAX_LINE_LENGTH && !is_comment(trimmed) {
                issues.push(Issue {
                    line: line_no,
                    kind: "line_too_long",
                    message: format!("Line exceeds {MAX_LINE_LENGTH} characters ({length})"),
                });
            }
            if line.contains("TODO") || line.contains("FIXME") {
                issues.push(Issue {
                    line: line_no,
                    kind: "todo_comment",
                    message: "TODO/FIXME comment found".into(),
                });
            }
            if DEBUG_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                issues.push(Issue {
                    line: line_no,
                    kind: "debug_statement",
                    message: "Debug print statement (consider using logging)".into(),
                });
            }
        }

        for func in self.functions(code).into_iter().filter(|f| !f.has_docstring) {
            issues.push(Issue {
                line: func.line_number,
                kind: "missing_docstring",
                message: format!("Function '{}' missing docstring", func.name),
            });
        }
        for ty in self.types(code).into_iter().filter(|t| !t.has_docstring) {
            issues.push(Issue {
                line: ty.line_number,
                kind: "missing_docstring",
                message: format!("Class '{}' missing docstring", ty.name),
            });
        }

        issues.sort_by_key(|i| i.line);
        issues
    }
}

/// Doc comment directly above the declaration (attributes and decorators
/// skipped), or a triple-quoted docstring right after its signature.
fn has_doc(lines: &[&str], idx: usize) -> bool {
    let above = lines[..idx]
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !(l.starts_with("#[") || l.starts_with('@')));
    if let Some(line) = above {
        if line.starts_with("///") || line.starts_with("/**") || line.ends_with("*/") {
            return true;
        }
    }

    let Some(sig_end) = lines[idx..]
        .iter()
        .take(10)
        .position(|l| {
            let l = l.trim_end();
            l.ends_with(':') || l.ends_with('{')
        })
        .map(|offset| idx + offset)
    else {
        return false;
    };
    lines[sig_end + 1..]
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .is_some_and(|l| ["\"\"\"", "'''", "r\"\"\""].iter().any(|q| l.starts_with(q)))
}

fn source(state: &RunState) -> String {
    state.get_string(CODE_KEY, "")
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// `extract_functions`: `functions` and `function_count`.
pub struct ExtractFunctions {
    scanner: Arc<SourceScanner>,
}

#[async_trait]
impl Capability for ExtractFunctions {
    fn name(&self) -> &str {
        "extract_functions"
    }

    async fn invoke(&self, state: &RunState, _config: &Config) -> Result<StepOutput> {
        let functions = self.scanner.functions(&source(state));
        let mut out = Config::new();
        out.insert("function_count".into(), json!(functions.len()));
        out.insert("functions".into(), serde_json::to_value(&functions)?);
        Ok(StepOutput::Merge(out))
    }
}

/// `check_complexity`: functions over the configured `threshold`.
pub struct CheckComplexity {
    scanner: Arc<SourceScanner>,
}

#[async_trait]
impl Capability for CheckComplexity {
    fn name(&self) -> &str {
        "check_complexity"
    }

    async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput> {
        let threshold = config
            .get("threshold")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_COMPLEXITY_THRESHOLD);
        let functions = self.scanner.functions(&source(state));
        let max_complexity = functions.iter().map(|f| f.complexity).max().unwrap_or(0);
        let complexity_issues: Vec<Value> = functions
            .iter()
            .filter(|f| f.complexity > threshold)
            .map(|f| {
                json!({
                    "name": f.name,
                    "complexity": f.complexity,
                    "line_number": f.line_number,
                    "type": "function",
                })
            })
            .collect();

        let mut out = Config::new();
        out.insert("complexity_issues".into(), Value::Array(complexity_issues));
        out.insert("max_complexity".into(), json!(max_complexity));
        out.insert("complexity_threshold".into(), json!(threshold));
        Ok(StepOutput::Merge(out))
    }
}

/// `detect_issues`: style and documentation problems.
pub struct DetectIssues {
    scanner: Arc<SourceScanner>,
}

#[async_trait]
impl Capability for DetectIssues {
    fn name(&self) -> &str {
        "detect_issues"
    }

    async fn invoke(&self, state: &RunState, _config: &Config) -> Result<StepOutput> {
        let issues = self.scanner.issues(&source(state));
        let mut out = Config::new();
        out.insert("issue_count".into(), json!(issues.len()));
        out.insert("issues".into(), serde_json::to_value(&issues)?);
        Ok(StepOutput::Merge(out))
    }
}

/// `suggest_improvements`: folds the earlier findings into suggestions and a
/// 0–100 `quality_score`.
pub struct SuggestImprovements;

#[async_trait]
impl Capability for SuggestImprovements {
    fn name(&self) -> &str {
        "suggest_improvements"
    }

    async fn invoke(&self, state: &RunState, _config: &Config) -> Result<StepOutput> {
        let complexity_issues = state
            .get("complexity_issues")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let issues = state
            .get("issues")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let count_of = |kind: &str| {
            issues
                .iter()
                .filter(|i| i.get("type").and_then(Value::as_str) == Some(kind))
                .count()
        };

        let mut suggestions = Vec::new();
        if !complexity_issues.is_empty() {
            let details: Vec<String> = complexity_issues
                .iter()
                .take(3)
                .map(|i| {
                    format!(
                        "{} (complexity: {})",
                        i.get("name").and_then(Value::as_str).unwrap_or("?"),
                        i.get("complexity").cloned().unwrap_or(Value::Null)
                    )
                })
                .collect();
            suggestions.push(json!({
                "category": "complexity",
                "priority": "high",
                "message": format!("Reduce complexity in {} function(s)", complexity_issues.len()),
                "details": details,
            }));
        }
        let missing_docs = count_of("missing_docstring");
        if missing_docs > 0 {
            suggestions.push(json!({
                "category": "documentation",
                "priority": "medium",
                "message": format!("Add docstrings to {missing_docs} function(s)/class(es)"),
            }));
        }
        let long_lines = count_of("line_too_long");
        if long_lines > 0 {
            suggestions.push(json!({
                "category": "formatting",
                "priority": "low",
                "message": format!("Shorten {long_lines} long line(s)"),
            }));
        }

        let total_issues = (complexity_issues.len() + issues.len()) as f64;
        let function_count = state
            .get("function_count")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as f64;
        let quality_score = (100.0 - total_issues / function_count * 10.0).max(0.0);
        tracing::debug!(quality_score, suggestions = suggestions.len(), "Scored review");

        let mut out = Config::new();
        out.insert("suggestion_count".into(), json!(suggestions.len()));
        out.insert("suggestions".into(), Value::Array(suggestions));
        out.insert("quality_score".into(), json!(quality_score));
        Ok(StepOutput::Merge(out))
    }
}

/// Register the four review tools, sharing one compiled scanner.
pub fn register(registry: &mut CapabilityRegistry) -> Result<()> {
    let scanner = Arc::new(SourceScanner::new()?);
    registry.register(ExtractFunctions { scanner: Arc::clone(&scanner) });
    registry.register(CheckComplexity { scanner: Arc::clone(&scanner) });
    registry.register(DetectIssues { scanner });
    registry.register(SuggestImprovements);
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// The review loop: extract → complexity → detect → suggest, returning to
/// `extract` while `quality_score` stays under `quality_threshold`, at most
/// `max_iterations` times.
pub fn code_review_graph(
    complexity_threshold: u64,
    quality_threshold: f64,
    max_iterations: u32,
) -> GraphDefinition {
    let below_threshold = format!("state.get('quality_score', 0) < {quality_threshold:?}");
    GraphDefinition::new("Code Review Agent", "extract")
        .with_description("Automated code review workflow with iterative refinement")
        .with_node(NodeSpec::tool("extract", "extract_functions"))
        .with_node(
            NodeSpec::tool("complexity", "check_complexity")
                .with_config("threshold", json!(complexity_threshold)),
        )
        .with_node(NodeSpec::tool("detect", "detect_issues"))
        .with_node(NodeSpec::tool("suggest", "suggest_improvements"))
        .edge("extract", "complexity")
        .edge("complexity", "detect")
        .edge("detect", "suggest")
        .conditional("suggest", "extract", below_threshold.clone())
        .loop_on("extract", below_threshold, max_iterations)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON: &str = r#"def add(a, b=2):
    """Add numbers."""
    return a + b

def branchy(x):
    if x > 1 and x < 10:
        for i in range(x):
            if i % 2:
                print(i)
    return x
"#;

    const RUST: &str = r#"/// Doubles.
pub fn double(x: i64) -> i64 {
    x * 2
}

#[inline]
pub(crate) fn check(a: &str, mut b: Vec<u8>) -> bool {
    // TODO: tighten if needed
    if a.is_empty() || b.is_empty() { return false; }
    true
}

struct Plain;
"#;

    fn scanner() -> SourceScanner {
        SourceScanner::new().unwrap()
    }

    fn code_state(code: &str) -> RunState {
        let mut state = RunState::new();
        state.set("code", json!(code));
        state
    }

    fn merged(out: StepOutput) -> Config {
        match out {
            StepOutput::Merge(map) => map,
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn finds_python_functions() {
        let functions = scanner().functions(PYTHON);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "add");
        assert_eq!(functions[0].args, ["a", "b"]);
        assert!(functions[0].has_docstring);
        assert_eq!(functions[0].complexity, 1);
        assert_eq!(functions[1].name, "branchy");
        assert_eq!(functions[1].line_number, 5);
        assert!(!functions[1].has_docstring);
        // if, and, for, if
        assert_eq!(functions[1].complexity, 5);
    }

    #[test]
    fn finds_rust_functions_and_doc_comments() {
        let functions = scanner().functions(RUST);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "double");
        assert!(functions[0].has_docstring);
        assert_eq!(functions[1].name, "check");
        assert_eq!(functions[1].args, ["a", "b"]);
        assert!(!functions[1].has_docstring);
        // if, || (the commented line is skipped)
        assert_eq!(functions[1].complexity, 3);
    }

    #[test]
    fn detects_line_issues() {
        let long = format!("x = '{}'\n", "a".repeat(120));
        let comment = format!("# {}\n", "a".repeat(120));
        let code = format!("{long}{comment}print('hi')\n# FIXME later\n");
        let issues = scanner().issues(&code);
        let kinds: Vec<_> = issues.iter().map(|i| (i.line, i.kind)).collect();
        assert_eq!(
            kinds,
            [(1, "line_too_long"), (3, "debug_statement"), (4, "todo_comment")]
        );
    }

    #[test]
    fn reports_missing_docs_for_functions_and_types() {
        let issues = scanner().issues(RUST);
        let missing: Vec<_> = issues
            .iter()
            .filter(|i| i.kind == "missing_docstring")
            .map(|i| i.message.as_str())
            .collect();
        assert_eq!(
            missing,
            ["Function 'check' missing docstring", "Class 'Plain' missing docstring"]
        );
        assert!(issues.iter().any(|i| i.kind == "todo_comment" && i.line == 8));
    }

    #[tokio::test]
    async fn empty_code_has_no_functions() {
        let out = merged(
            ExtractFunctions { scanner: Arc::new(scanner()) }
                .invoke(&code_state(""), &Config::new())
                .await
                .unwrap(),
        );
        assert_eq!(out["function_count"], json!(0));
        assert_eq!(out["functions"], json!([]));
    }

    #[tokio::test]
    async fn complexity_respects_threshold_config() {
        let cap = CheckComplexity { scanner: Arc::new(scanner()) };
        let mut config = Config::new();
        config.insert("threshold".into(), json!(3));
        let out = merged(cap.invoke(&code_state(PYTHON), &config).await.unwrap());
        assert_eq!(out["max_complexity"], json!(5));
        assert_eq!(out["complexity_threshold"], json!(3));
        assert_eq!(
            out["complexity_issues"],
            json!([{"name": "branchy", "complexity": 5, "line_number": 5, "type": "function"}])
        );

        let out = merged(cap.invoke(&code_state(PYTHON), &Config::new()).await.unwrap());
        assert_eq!(out["complexity_issues"], json!([]));
    }

    #[tokio::test]
    async fn suggestions_and_score() {
        let state = RunState::try_from(json!({
            "function_count": 2,
            "complexity_issues": [{"name": "branchy", "complexity": 5}],
            "issues": [
                {"line": 5, "type": "missing_docstring", "message": "m"},
                {"line": 9, "type": "line_too_long", "message": "l"},
            ],
        }))
        .unwrap();
        let out = merged(SuggestImprovements.invoke(&state, &Config::new()).await.unwrap());
        assert_eq!(out["suggestion_count"], json!(3));
        assert_eq!(out["suggestions"][0]["category"], json!("complexity"));
        assert_eq!(out["suggestions"][0]["details"], json!(["branchy (complexity: 5)"]));
        assert_eq!(out["suggestions"][2]["category"], json!("formatting"));
        assert_eq!(out["suggestions"][1]["priority"], json!("medium"));
        assert_eq!(out["suggestions"][2]["message"], json!("Shorten 1 long line(s)"));
        assert_eq!(out["quality_score"], json!(85.0));
    }

    #[tokio::test]
    async fn score_floors_at_zero_and_tolerates_no_functions() {
        let issues: Vec<Value> = (0..20)
            .map(|n| json!({"line": n, "type": "todo_comment", "message": "t"}))
            .collect();
        let state = RunState::try_from(json!({"function_count": 0, "issues": issues})).unwrap();
        let out = merged(SuggestImprovements.invoke(&state, &Config::new()).await.unwrap());
        assert_eq!(out["quality_score"], json!(0.0));
        assert_eq!(out["suggestion_count"], json!(0));
    }

    #[test]
    fn review_graph_shape() {
        let def = code_review_graph(10, 70.0, 5);
        assert_eq!(def.name, "Code Review Agent");
        assert_eq!(def.entry_node, "extract");
        assert_eq!(def.nodes.len(), 4);
        assert_eq!(def.node("complexity").unwrap().config["threshold"], json!(10));
        assert_eq!(def.loops[0].condition, "state.get('quality_score', 0) < 70.0");
        assert_eq!(def.loops[0].max_iterations, 5);
    }
}
