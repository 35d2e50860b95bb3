//! Declarative post-execution verification gates.
//!
//! Gates check produced artifacts against declared conditions: test reports,
//! diff size limits, schema validity, artifact presence. Every gate failure
//! is a result, never an error; one misbehaving gate cannot take down the
//! evaluation of the rest.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

fn default_test_report() -> String {
    "test_results.json".to_string()
}

fn default_diff_file() -> String {
    "changes.diff".to_string()
}

fn default_max_lines() -> usize {
    1000
}

fn default_schema_dir() -> String {
    ".ai/schemas".to_string()
}

/// Gate condition, tagged by `type` in gate files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateKind {
    /// Pass iff the test report shows zero failures
    TestsPass {
        #[serde(default = "default_test_report")]
        test_report: String,
    },
    /// Pass iff the produced diff stays under a line limit
    DiffLimits {
        #[serde(default = "default_max_lines")]
        max_lines: usize,
        #[serde(default = "default_diff_file")]
        diff_file: String,
    },
    /// Pass iff every listed artifact validates against its schema
    SchemaValid {
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default = "default_schema_dir")]
        schema_dir: String,
        #[serde(default)]
        schema_map: HashMap<String, String>,
    },
    /// Validate a YAML document against a JSON schema
    YamlSchemaValid { file: String, schema: String },
    /// Confirm an artifact exists, optionally schema-validated
    ArtifactGate {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        schema: Option<String>,
    },
    /// Registered handler keyed by name
    Custom {
        handler: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl GateKind {
    fn type_name(&self) -> &'static str {
        match self {
            Self::TestsPass { .. } => "tests_pass",
            Self::DiffLimits { .. } => "diff_limits",
            Self::SchemaValid { .. } => "schema_valid",
            Self::YamlSchemaValid { .. } => "yaml_schema_valid",
            Self::ArtifactGate { .. } => "artifact_gate",
            Self::Custom { .. } => "custom",
        }
    }
}

/// One declared gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: GateKind,
}

impl GateSpec {
    /// Display name: explicit name or the gate type.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.type_name())
    }

    /// Load a list of gates from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<GateSpec>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Outcome of one gate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl GateResult {
    fn passed(name: &str, message: impl Into<String>) -> Self {
        Self {
            gate_name: name.to_string(),
            passed: true,
            message: message.into(),
            details: Map::new(),
        }
    }

    fn failed(name: &str, message: impl Into<String>) -> Self {
        Self {
            gate_name: name.to_string(),
            passed: false,
            message: message.into(),
            details: Map::new(),
        }
    }

    fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

/// Aggregate over a gate run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSummary {
    pub total_gates: usize,
    pub passed: usize,
    pub failed: usize,
    pub overall_success: bool,
}

/// Custom gate handler signature.
pub type CustomGateFn =
    Box<dyn Fn(&GateSpec, &Path, &ExecutionContext) -> GateResult + Send + Sync>;

/// Evaluates declarative gates against an artifacts directory.
#[derive(Default)]
pub struct GateEngine {
    custom: HashMap<String, CustomGateFn>,
}

impl GateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom gate handler under a name.
    pub fn register_custom(&mut self, name: impl Into<String>, handler: CustomGateFn) {
        self.custom.insert(name.into(), handler);
    }

    /// Evaluate every gate; individual failures never abort the run.
    pub fn check_gates(
        &self,
        gates: &[GateSpec],
        artifacts_dir: &Path,
        context: &ExecutionContext,
    ) -> Vec<GateResult> {
        gates
            .iter()
            .map(|gate| self.check_gate(gate, artifacts_dir, context))
            .collect()
    }

    /// Summarize a set of gate results.
    pub fn summarize(results: &[GateResult]) -> GateSummary {
        let passed = results.iter().filter(|r| r.passed).count();
        GateSummary {
            total_gates: results.len(),
            passed,
            failed: results.len() - passed,
            overall_success: passed == results.len(),
        }
    }

    fn check_gate(
        &self,
        gate: &GateSpec,
        artifacts_dir: &Path,
        context: &ExecutionContext,
    ) -> GateResult {
        let name = gate.display_name();
        match &gate.kind {
            GateKind::TestsPass { test_report } => {
                check_tests_pass(name, artifacts_dir, test_report)
            }
            GateKind::DiffLimits {
                max_lines,
                diff_file,
            } => check_diff_limits(name, artifacts_dir, *max_lines, diff_file),
            GateKind::SchemaValid {
                artifacts,
                schema_dir,
                schema_map,
            } => check_schema_valid(name, artifacts_dir, artifacts, schema_dir, schema_map),
            GateKind::YamlSchemaValid { file, schema } => {
                check_yaml_schema(name, file, schema)
            }
            GateKind::ArtifactGate { path, schema } => {
                check_artifact(name, artifacts_dir, path.as_deref(), schema.as_deref())
            }
            GateKind::Custom { handler, .. } => match self.custom.get(handler) {
                Some(check) => {
                    // A panicking handler fails its own gate only.
                    std::panic::catch_unwind(AssertUnwindSafe(|| {
                        check(gate, artifacts_dir, context)
                    }))
                    .unwrap_or_else(|_| {
                        GateResult::failed(name, format!("Custom gate '{}' panicked", handler))
                    })
                }
                None => GateResult::failed(name, format!("Unknown custom gate: {}", handler)),
            },
        }
    }
}

fn resolve(artifacts_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        artifacts_dir.join(candidate)
    }
}

fn check_tests_pass(name: &str, artifacts_dir: &Path, test_report: &str) -> GateResult {
    let report_path = resolve(artifacts_dir, test_report);
    if !report_path.exists() {
        return GateResult::failed(
            name,
            format!("Test report not found: {}", report_path.display()),
        );
    }

    let report: Value = match std::fs::read_to_string(&report_path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(report) => report,
        Err(e) => return GateResult::failed(name, format!("Could not read test report: {}", e)),
    };

    let tests_passed = report["tests_passed"].as_u64().unwrap_or(0);
    let tests_failed = report["tests_failed"].as_u64().unwrap_or(0);
    let total = tests_passed + tests_failed;

    let mut details = Map::new();
    details.insert("tests_passed".into(), json!(tests_passed));
    details.insert("tests_failed".into(), json!(tests_failed));
    details.insert("total_tests".into(), json!(total));

    if tests_failed > 0 {
        GateResult::failed(name, format!("{} tests failed out of {}", tests_failed, total))
            .with_details(details)
    } else {
        GateResult::passed(name, format!("All {} tests passed", tests_passed))
            .with_details(details)
    }
}

fn check_diff_limits(
    name: &str,
    artifacts_dir: &Path,
    max_lines: usize,
    diff_file: &str,
) -> GateResult {
    let diff_path = resolve(artifacts_dir, diff_file);
    if !diff_path.exists() {
        return GateResult::passed(name, "No diff file found - assuming no changes");
    }

    let text = match std::fs::read_to_string(&diff_path) {
        Ok(text) => text,
        Err(e) => return GateResult::failed(name, format!("Could not read diff file: {}", e)),
    };
    let line_count = text.lines().count();

    let mut details = Map::new();
    details.insert("line_count".into(), json!(line_count));
    details.insert("max_lines".into(), json!(max_lines));

    if line_count > max_lines {
        GateResult::failed(
            name,
            format!("Diff too large: {} lines (max: {})", line_count, max_lines),
        )
        .with_details(details)
    } else {
        GateResult::passed(name, format!("Diff size acceptable: {} lines", line_count))
            .with_details(details)
    }
}

/// Conventional artifact-name to schema-file mapping.
fn conventional_schema(artifact: &str, schema_dir: &str) -> Option<PathBuf> {
    let file_name = Path::new(artifact).file_name()?.to_string_lossy();
    let schema = if file_name.contains("code-review") {
        "ai_code_review.schema.json"
    } else if file_name.contains("architecture") {
        "ai_architecture_analysis.schema.json"
    } else if file_name.contains("refactor-plan") {
        "ai_refactor_plan.schema.json"
    } else if file_name.contains("test-plan") {
        "ai_test_plan.schema.json"
    } else if file_name.contains("improvements") {
        "ai_improvements.schema.json"
    } else {
        return None;
    };
    Some(Path::new(schema_dir).join(schema))
}

/// Minimal artifact contract: a JSON object carrying `timestamp` and `type`.
fn basic_artifact_check(artifact: &Value) -> bool {
    artifact.get("timestamp").is_some() && artifact.get("type").is_some()
}

/// Validate a JSON artifact file, against a schema when one is given and
/// readable, otherwise against the basic envelope contract.
pub fn verify_artifact(artifact_path: &Path, schema_path: Option<&Path>) -> bool {
    let Ok(text) = std::fs::read_to_string(artifact_path) else {
        return false;
    };
    let Ok(artifact) = serde_json::from_str::<Value>(&text) else {
        return false;
    };

    match schema_path {
        Some(schema_path) if schema_path.exists() => {
            let Ok(schema_text) = std::fs::read_to_string(schema_path) else {
                return false;
            };
            let Ok(schema) = serde_json::from_str::<Value>(&schema_text) else {
                return false;
            };
            let Ok(validator) = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&schema)
            else {
                return false;
            };
            validator.validate(&artifact).is_ok()
        }
        _ => basic_artifact_check(&artifact),
    }
}

fn check_schema_valid(
    name: &str,
    artifacts_dir: &Path,
    artifacts: &[String],
    schema_dir: &str,
    schema_map: &HashMap<String, String>,
) -> GateResult {
    if artifacts.is_empty() {
        return GateResult::passed(name, "No artifacts specified");
    }

    let mut all_ok = true;
    let mut details = Map::new();
    for artifact in artifacts {
        let artifact_path = resolve(artifacts_dir, artifact);
        let schema_path = schema_map
            .get(artifact)
            .map(PathBuf::from)
            .or_else(|| conventional_schema(artifact, schema_dir));

        let ok = verify_artifact(&artifact_path, schema_path.as_deref());
        details.insert(artifact_path.display().to_string(), json!(ok));
        all_ok &= ok;
    }

    let message = if all_ok {
        "All artifacts valid"
    } else {
        "One or more artifacts invalid"
    };
    GateResult {
        gate_name: name.to_string(),
        passed: all_ok,
        message: message.to_string(),
        details,
    }
}

fn check_yaml_schema(name: &str, file: &str, schema: &str) -> GateResult {
    let yaml_path = Path::new(file);
    let schema_path = Path::new(schema);
    if !yaml_path.exists() {
        return GateResult::failed(name, format!("YAML file not found: {}", yaml_path.display()));
    }
    if !schema_path.exists() {
        return GateResult::failed(
            name,
            format!("Schema file not found: {}", schema_path.display()),
        );
    }

    let outcome = (|| -> std::result::Result<(), String> {
        let yaml_text = std::fs::read_to_string(yaml_path).map_err(|e| e.to_string())?;
        let document: Value = serde_yaml::from_str(&yaml_text).map_err(|e| e.to_string())?;
        let schema_text = std::fs::read_to_string(schema_path).map_err(|e| e.to_string())?;
        let schema: Value = serde_json::from_str(&schema_text).map_err(|e| e.to_string())?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|e| e.to_string())?;
        validator.validate(&document).map_err(|e| e.to_string())
    })();

    match outcome {
        Ok(()) => GateResult::passed(name, "YAML schema validation passed"),
        Err(e) => GateResult::failed(name, format!("YAML schema validation failed: {}", e)),
    }
}

fn check_artifact(
    name: &str,
    artifacts_dir: &Path,
    path: Option<&str>,
    schema: Option<&str>,
) -> GateResult {
    let Some(path) = path else {
        return GateResult::passed(name, "No artifact specified");
    };
    let artifact_path = resolve(artifacts_dir, path);
    if !artifact_path.exists() {
        return GateResult::failed(
            name,
            format!("Artifact not found: {}", artifact_path.display()),
        );
    }

    let ok = match schema {
        Some(schema) => verify_artifact(&artifact_path, Some(Path::new(schema))),
        None => verify_artifact(&artifact_path, None),
    };

    let mut details = Map::new();
    details.insert("path".into(), json!(artifact_path.display().to_string()));
    if ok {
        GateResult::passed(name, "Artifact valid").with_details(details)
    } else {
        GateResult::failed(name, "Artifact invalid").with_details(details)
    }
}
