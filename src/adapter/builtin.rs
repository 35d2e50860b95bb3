//! Built-in adapters.
//!
//! Thin wrappers over common developer tools: enough for workflows to run
//! end to end, while the interesting logic stays in the tools themselves.
//! Deterministic adapters shell out via `tokio::process` and report zero
//! token cost; AI adapters drive an external AI CLI and meter tokens from
//! its output.

use super::{Adapter, AdapterKind, AdapterResult, PerformanceProfile};
use crate::context::ExecutionContext;
use crate::workflow::Step;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

/// Output of one subprocess run.
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_command(program: &str, args: &[String]) -> Result<CommandOutput, String> {
    debug!(%program, ?args, "spawning tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Write a JSON artifact with the standard `timestamp`/`type` envelope.
fn write_json_artifact(path: &str, artifact_type: &str, payload: Value) -> Result<(), String> {
    let mut object = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "type": artifact_type,
    });
    if let (Some(obj), Some(extra)) = (object.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let text = serde_json::to_string_pretty(&object).map_err(|e| e.to_string())?;
    std::fs::write(path, text).map_err(|e| e.to_string())
}

fn write_artifacts(step: &Step, artifact_type: &str, payload: &Value) -> (Vec<String>, Vec<String>) {
    let mut written = Vec::new();
    let mut errors = Vec::new();
    for path in &step.emits {
        match write_json_artifact(path, artifact_type, payload.clone()) {
            Ok(()) => written.push(path.clone()),
            Err(e) => errors.push(format!("{}: {}", path, e)),
        }
    }
    (written, errors)
}

fn param_str<'a>(step: &'a Step, key: &str, default: &'a str) -> &'a str {
    step.with_params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
}

fn param_u64(step: &Step, key: &str, default: u64) -> u64 {
    step.with_params
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

fn file_target(step: &Step, files: Option<&str>) -> String {
    files
        .map(str::to_string)
        .or_else(|| step.claimed_patterns().into_iter().next())
        .unwrap_or_else(|| ".".to_string())
}

fn binary_available(name: &str) -> bool {
    which::which(name).is_ok()
}

// ---------------------------------------------------------------------------
// code_fixers
// ---------------------------------------------------------------------------

/// Deterministic formatter/fixer pipeline (`ruff --fix`, `black`).
pub struct CodeFixersAdapter;

impl CodeFixersAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodeFixersAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for CodeFixersAdapter {
    fn name(&self) -> &str {
        "code_fixers"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Deterministic
    }

    fn description(&self) -> &str {
        "Deterministic code formatting and auto-fixes (ruff, black)"
    }

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile {
            complexity_threshold: 0.4,
            preferred_file_types: vec![".py".into()],
            avg_execution_time: 2.0,
            ..PerformanceProfile::default()
        }
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult {
        let target = file_target(step, files);
        let mut transcript = String::new();
        let mut ran_any = false;
        let mut all_ok = true;

        if binary_available("ruff") {
            match run_command("ruff", &["check".into(), "--fix".into(), target.clone()]).await {
                Ok(out) => {
                    ran_any = true;
                    all_ok &= out.success;
                    transcript.push_str(&out.stdout);
                    transcript.push_str(&out.stderr);
                }
                Err(e) => return AdapterResult::fail(e),
            }
        }
        if binary_available("black") {
            match run_command("black", &[target.clone()]).await {
                Ok(out) => {
                    ran_any = true;
                    all_ok &= out.success;
                    transcript.push_str(&out.stderr);
                }
                Err(e) => return AdapterResult::fail(e),
            }
        }

        if !ran_any {
            return AdapterResult::fail("no fixer tool available (ruff, black)");
        }

        let (artifacts, write_errors) = write_artifacts(
            step,
            "code_fixers_report",
            &json!({ "target": target, "clean": all_ok }),
        );
        if !write_errors.is_empty() {
            return AdapterResult::fail(write_errors.join("; "));
        }

        AdapterResult {
            success: all_ok,
            output: transcript,
            artifacts,
            error: (!all_ok).then(|| "fixers reported remaining issues".to_string()),
            ..AdapterResult::default()
        }
    }

    fn validate_step(&self, _step: &Step) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        binary_available("ruff") || binary_available("black")
    }
}

// ---------------------------------------------------------------------------
// vscode_diagnostics
// ---------------------------------------------------------------------------

/// Deterministic lint diagnostics collection.
pub struct VscodeDiagnosticsAdapter;

impl VscodeDiagnosticsAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VscodeDiagnosticsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for VscodeDiagnosticsAdapter {
    fn name(&self) -> &str {
        "vscode_diagnostics"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Deterministic
    }

    fn description(&self) -> &str {
        "Collect lint diagnostics without modifying files"
    }

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile {
            complexity_threshold: 0.45,
            preferred_file_types: vec![".py".into()],
            ..PerformanceProfile::default()
        }
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult {
        let target = file_target(step, files);
        let out = match run_command(
            "ruff",
            &["check".into(), "--output-format".into(), "json".into(), target.clone()],
        )
        .await
        {
            Ok(out) => out,
            Err(e) => return AdapterResult::fail(e),
        };

        let diagnostics: Vec<Value> =
            serde_json::from_str(out.stdout.trim()).unwrap_or_default();
        let (artifacts, write_errors) = write_artifacts(
            step,
            "diagnostics_report",
            &json!({ "target": target, "diagnostic_count": diagnostics.len() }),
        );
        if !write_errors.is_empty() {
            return AdapterResult::fail(write_errors.join("; "));
        }

        AdapterResult {
            success: true,
            output: format!("{} diagnostics", diagnostics.len()),
            artifacts,
            ..AdapterResult::default()
        }
        .with_metadata("diagnostic_count", json!(diagnostics.len()))
    }

    fn validate_step(&self, _step: &Step) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        binary_available("ruff")
    }
}

// ---------------------------------------------------------------------------
// pytest_runner
// ---------------------------------------------------------------------------

static PYTEST_PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+passed").expect("invalid regex"));
static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+failed").expect("invalid regex"));

/// Deterministic test runner over pytest.
pub struct PytestRunnerAdapter;

impl PytestRunnerAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Counts from the summary line. The outcomes appear in severity order
    /// ("failed" before "passed"), so each count is matched on its own.
    fn parse_summary(output: &str) -> (u64, u64) {
        for line in output.lines().rev() {
            if line.contains("passed") || line.contains("failed") {
                let count = |re: &Regex| {
                    re.captures(line)
                        .and_then(|caps| caps[1].parse().ok())
                        .unwrap_or(0)
                };
                return (count(&PYTEST_PASSED), count(&PYTEST_FAILED));
            }
        }
        (0, 0)
    }
}

impl Default for PytestRunnerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for PytestRunnerAdapter {
    fn name(&self) -> &str {
        "pytest_runner"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Deterministic
    }

    fn description(&self) -> &str {
        "Run pytest and emit a structured test report"
    }

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile {
            complexity_threshold: 0.5,
            preferred_file_types: vec![".py".into()],
            avg_execution_time: 10.0,
            ..PerformanceProfile::default()
        }
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult {
        let mut args = vec!["-q".to_string()];
        if let Some(pattern) = files {
            args.push(pattern.to_string());
        } else if let Some(first) = step.claimed_patterns().into_iter().next() {
            args.push(first);
        }
        if let Some(extra) = step.with_params.get("args").and_then(Value::as_str) {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        let out = match run_command("pytest", &args).await {
            Ok(out) => out,
            Err(e) => return AdapterResult::fail(e),
        };

        let (passed, failed) = Self::parse_summary(&out.stdout);
        let (artifacts, write_errors) = write_artifacts(
            step,
            "test_results",
            &json!({
                "tests_passed": passed,
                "tests_failed": failed,
                "total_tests": passed + failed,
            }),
        );
        if !write_errors.is_empty() {
            return AdapterResult::fail(write_errors.join("; "));
        }

        AdapterResult {
            success: out.success,
            output: out.stdout,
            artifacts,
            error: (!out.success).then(|| format!("{} tests failed", failed)),
            ..AdapterResult::default()
        }
        .with_metadata("tests_passed", json!(passed))
        .with_metadata("tests_failed", json!(failed))
    }

    fn validate_step(&self, _step: &Step) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        binary_available("pytest")
    }
}

// ---------------------------------------------------------------------------
// git_ops
// ---------------------------------------------------------------------------

/// Deterministic read-only git operations.
pub struct GitOpsAdapter;

impl GitOpsAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GitOpsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for GitOpsAdapter {
    fn name(&self) -> &str {
        "git_ops"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Deterministic
    }

    fn description(&self) -> &str {
        "Read repository state: status, diff, log"
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        _files: Option<&str>,
    ) -> AdapterResult {
        let operation = param_str(step, "operation", "status");
        let args: Vec<String> = match operation {
            "status" => vec!["status".into(), "--porcelain".into()],
            "diff" => vec!["diff".into()],
            "log" => vec!["log".into(), "--oneline".into(), "-20".into()],
            other => {
                return AdapterResult::fail(format!("unsupported git operation: {}", other))
            }
        };

        let out = match run_command("git", &args).await {
            Ok(out) => out,
            Err(e) => return AdapterResult::fail(e),
        };
        if !out.success {
            return AdapterResult::fail(format!("git {} failed: {}", operation, out.stderr));
        }

        // Diff output is written raw so downstream diff gates can measure it.
        let mut artifacts = Vec::new();
        for path in &step.emits {
            let target = Path::new(path);
            if let Some(parent) = target.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return AdapterResult::fail(format!("{}: {}", path, e));
                }
            }
            if let Err(e) = std::fs::write(target, &out.stdout) {
                return AdapterResult::fail(format!("{}: {}", path, e));
            }
            artifacts.push(path.clone());
        }

        AdapterResult {
            success: true,
            output: out.stdout,
            artifacts,
            ..AdapterResult::default()
        }
        .with_metadata("operation", json!(operation))
    }

    fn validate_step(&self, step: &Step) -> bool {
        matches!(
            param_str(step, "operation", "status"),
            "status" | "diff" | "log"
        )
    }

    fn is_available(&self) -> bool {
        binary_available("git")
    }
}

// ---------------------------------------------------------------------------
// AI adapters
// ---------------------------------------------------------------------------

static TOKEN_REPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d,]+)\s*tokens").expect("invalid regex"));

fn extract_tokens(output: &str) -> u64 {
    TOKEN_REPORT
        .captures_iter(output)
        .filter_map(|caps| caps[1].replace(',', "").parse::<u64>().ok())
        .sum()
}

fn ai_cli_available() -> bool {
    binary_available("aider")
        && (std::env::var("ANTHROPIC_API_KEY").is_ok() || std::env::var("OPENAI_API_KEY").is_ok())
}

/// Conservative upper-bound token estimate for a prompted AI step.
fn ai_cost_estimate(step: &Step, default_max_tokens: u64) -> u64 {
    let prompt = param_str(step, "prompt", "");
    let max_tokens = param_u64(step, "max_tokens", default_max_tokens);
    500 + (prompt.len() as u64 / 4) + 2 * max_tokens
}

async fn run_ai_cli(step: &Step, files: Option<&str>, extra_args: &[&str]) -> AdapterResult {
    let prompt = param_str(step, "prompt", "");
    let model = param_str(step, "model", "claude-3-5-sonnet-20241022").to_string();

    let mut args: Vec<String> = vec![
        "--yes".into(),
        "--no-stream".into(),
        "--model".into(),
        model.clone(),
        "--message".into(),
        prompt.to_string(),
    ];
    args.extend(extra_args.iter().map(|a| a.to_string()));
    if let Some(pattern) = files {
        // Expand the pattern so the CLI sees concrete paths.
        if let Ok(paths) = glob::glob(pattern) {
            args.extend(
                paths
                    .filter_map(|p| p.ok())
                    .map(|p| p.to_string_lossy().into_owned()),
            );
        }
    }

    let out = match run_command("aider", &args).await {
        Ok(out) => out,
        Err(e) => return AdapterResult::fail(e),
    };
    if !out.success {
        return AdapterResult::fail(format!("ai cli failed: {}", out.stderr));
    }

    let tokens = extract_tokens(&out.stdout);
    AdapterResult::ok(out.stdout)
        .with_tokens(tokens)
        .with_metadata("model", json!(model))
}

/// AI-backed code editor driving an external AI CLI.
pub struct AiEditorAdapter;

impl AiEditorAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AiEditorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for AiEditorAdapter {
    fn name(&self) -> &str {
        "ai_editor"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Ai
    }

    fn description(&self) -> &str {
        "AI-powered code editing through an external AI CLI"
    }

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile {
            complexity_threshold: 0.95,
            max_files: 20,
            avg_execution_time: 30.0,
            cost_efficiency: 4000.0,
            parallel_capable: false,
            requires_network: true,
            requires_api_key: true,
            ..PerformanceProfile::default()
        }
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult {
        if !self.validate_step(step) {
            return AdapterResult::fail("ai_editor requires a non-empty 'prompt' parameter");
        }
        run_ai_cli(step, files, &[]).await
    }

    fn validate_step(&self, step: &Step) -> bool {
        !param_str(step, "prompt", "").is_empty()
    }

    fn estimate_cost(&self, step: &Step) -> u64 {
        ai_cost_estimate(step, 4000)
    }

    fn is_available(&self) -> bool {
        ai_cli_available()
    }
}

/// AI-backed analyst producing reviews and assessments without edits.
pub struct AiAnalystAdapter;

impl AiAnalystAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AiAnalystAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for AiAnalystAdapter {
    fn name(&self) -> &str {
        "ai_analyst"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Ai
    }

    fn description(&self) -> &str {
        "AI-powered analysis and review without file modifications"
    }

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile {
            complexity_threshold: 0.9,
            avg_execution_time: 20.0,
            cost_efficiency: 2000.0,
            requires_network: true,
            requires_api_key: true,
            ..PerformanceProfile::default()
        }
    }

    async fn execute(
        &self,
        step: &Step,
        _context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult {
        if !self.validate_step(step) {
            return AdapterResult::fail("ai_analyst requires a non-empty 'prompt' parameter");
        }
        let result = run_ai_cli(step, files, &["--no-auto-commits", "--dry-run"]).await;
        if !result.success {
            return result;
        }

        let (artifacts, write_errors) = write_artifacts(
            step,
            "ai_analysis",
            &json!({ "analysis_type": param_str(step, "analysis_type", "review") }),
        );
        if !write_errors.is_empty() {
            return AdapterResult::fail(write_errors.join("; "));
        }
        AdapterResult {
            artifacts,
            ..result
        }
    }

    fn validate_step(&self, step: &Step) -> bool {
        !param_str(step, "prompt", "").is_empty()
    }

    fn estimate_cost(&self, step: &Step) -> u64 {
        ai_cost_estimate(step, 2000)
    }

    fn is_available(&self) -> bool {
        ai_cli_available()
    }
}
