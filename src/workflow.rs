//! Workflow document model.
//!
//! A workflow is a declarative YAML document: name, inputs, a routing/failure
//! policy, and an ordered list of steps. Workflows are loaded once per
//! invocation and immutable during execution.

use crate::error::{Error, Result};
use crate::scope::ScopeMode;
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// File pattern(s) attached to a step: a single glob or a list of globs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePatterns {
    /// Single glob pattern
    One(String),
    /// List of glob patterns
    Many(Vec<String>),
}

impl FilePatterns {
    /// Flatten into a list of pattern strings.
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Self::One(p) => vec![p.clone()],
            Self::Many(ps) => ps.clone(),
        }
    }
}

/// Per-step timeout configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Wall-clock limit for one step execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_step_seconds: Option<u64>,
}

/// A single workflow step, consumed once by the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the workflow
    #[serde(default)]
    pub id: String,
    /// Human-readable step name
    #[serde(default)]
    pub name: String,
    /// Adapter key this step is addressed to
    #[serde(default)]
    pub actor: String,
    /// Adapter-specific parameters
    #[serde(default, rename = "with")]
    pub with_params: Map<String, Value>,
    /// File glob(s) the step operates on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FilePatterns>,
    /// Additional file-scope claim patterns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_scope: Option<FilePatterns>,
    /// Artifact paths the adapter is expected to produce
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<String>,
    /// Scope claim mode for parallel planning
    #[serde(default)]
    pub scope_mode: ScopeMode,
    /// Retry configuration (adapter-interpreted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Value>,
    /// Conditional-execution expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Declared context dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Timeout configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,
}

impl Step {
    /// All file patterns claimed by this step (`files` plus `file_scope`).
    pub fn claimed_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        if let Some(files) = &self.files {
            patterns.extend(files.patterns());
        }
        if let Some(scope) = &self.file_scope {
            patterns.extend(scope.patterns());
        }
        patterns
    }

    /// Per-step timeout, if configured.
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeouts.as_ref().and_then(|t| t.per_step_seconds)
    }
}

/// Workflow policy influencing routing and failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Token ceiling for the whole workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Route to deterministic tools when feasible
    #[serde(default = "default_true")]
    pub prefer_deterministic: bool,
    /// Complexity score above which AI routing is considered
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: f64,
    /// Stop at the first failed step
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

fn default_true() -> bool {
    true
}

fn default_complexity_threshold() -> f64 {
    0.7
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_tokens: None,
            prefer_deterministic: true,
            complexity_threshold: 0.7,
            fail_fast: true,
        }
    }
}

/// A task inside a phase: either a bare name or a full step definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseTask {
    /// Full step definition
    Step(Step),
    /// Bare task name
    Name(String),
}

impl PhaseTask {
    /// View the task as a step, synthesizing one for bare names.
    pub fn as_step(&self) -> Step {
        match self {
            Self::Step(step) => step.clone(),
            Self::Name(name) => Step {
                id: name.clone(),
                name: name.clone(),
                actor: "unknown".to_string(),
                ..Step::default()
            },
        }
    }
}

/// A phase grouping tasks for coordinated multi-workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Phase role, e.g. "ipt" for integrated planning phases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<PhaseTask>,
}

/// Coordination metadata used for cross-workflow budget allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMeta {
    /// Workflow priority, 1 (low) to 5 (emergency)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Files the workflow intends to touch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_scope: Vec<String>,
}

/// Free-form workflow metadata with a typed coordination section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination: Option<CoordinationMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A declarative workflow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Phase groupings (coordinated execution pattern); most workflows use
    /// `steps` directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkflowMetadata>,
}

impl Workflow {
    /// Load a workflow from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::workflow_load(format!("cannot read {}: {}", path.display(), e))
        })?;
        if text.trim().is_empty() {
            return Err(Error::workflow_load(format!(
                "empty workflow file: {}",
                path.display()
            )));
        }
        let mut workflow: Workflow = serde_yaml::from_str(&text)
            .map_err(|e| Error::workflow_load(format!("{}: {}", path.display(), e)))?;
        if workflow.name.is_empty() {
            workflow.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed_workflow".to_string());
        }
        Ok(workflow)
    }

    /// Build a workflow from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::workflow_load(format!("invalid workflow document: {}", e)))
    }

    /// Structural validation: at least one step with unique ids and resolvable
    /// shape. Does not consult the adapter registry.
    pub fn validate_structure(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::workflow_invalid(
                "workflow must declare at least one step",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(Error::workflow_invalid(format!(
                    "step '{}' is missing an id",
                    step.name
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(Error::workflow_invalid(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        Ok(())
    }

    /// Coordination priority from metadata, defaulting to normal (2).
    pub fn coordination_priority(&self) -> u8 {
        self.metadata
            .as_ref()
            .and_then(|m| m.coordination.as_ref())
            .and_then(|c| c.priority)
            .unwrap_or(2)
    }

    /// Coordination file scope from metadata.
    pub fn coordination_file_scope(&self) -> &[String] {
        self.metadata
            .as_ref()
            .and_then(|m| m.coordination.as_ref())
            .map(|c| c.file_scope.as_slice())
            .unwrap_or(&[])
    }
}

/// Compiled JSON-Schema validator for workflow documents.
pub struct WorkflowSchema {
    validator: Validator,
}

impl WorkflowSchema {
    /// Compile a validator from a JSON Schema document.
    pub fn compile(schema: &Value) -> Result<Self> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|e| Error::Config(format!("invalid workflow schema: {}", e)))?;
        Ok(Self { validator })
    }

    /// Load and compile a schema from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let schema: Value = serde_json::from_str(&text)?;
        Self::compile(&schema)
    }

    /// Validate a workflow document, collecting every violation.
    pub fn validate(&self, workflow: &Workflow) -> Result<()> {
        let doc = serde_json::to_value(workflow)?;
        let errors: Vec<String> = self
            .validator
            .iter_errors(&doc)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::workflow_invalid(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
name: quality-pass
steps:
  - id: "1.001"
    name: Fix formatting
    actor: code_fixers
    files: "src/**/*.py"
"#;

    #[test]
    fn test_parse_minimal_workflow() {
        let wf: Workflow = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(wf.name, "quality-pass");
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].actor, "code_fixers");
        assert_eq!(
            wf.steps[0].claimed_patterns(),
            vec!["src/**/*.py".to_string()]
        );
        assert!(wf.policy.prefer_deterministic);
        assert!(wf.policy.fail_fast);
        assert_eq!(wf.policy.complexity_threshold, 0.7);
    }

    #[test]
    fn test_files_accepts_list() {
        let yaml = r#"
name: multi
steps:
  - id: a
    name: touch many
    actor: code_fixers
    files:
      - "src/a.py"
      - "src/b.py"
    file_scope: "docs/**"
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            wf.steps[0].claimed_patterns(),
            vec!["src/a.py", "src/b.py", "docs/**"]
        );
    }

    #[test]
    fn test_empty_steps_rejected() {
        let wf: Workflow = serde_yaml::from_str("name: empty\nsteps: []").unwrap();
        let err = wf.validate_structure().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let yaml = r#"
name: dup
steps:
  - {id: a, name: one, actor: code_fixers}
  - {id: a, name: two, actor: code_fixers}
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        let err = wf.validate_structure().unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_scope_mode_default_exclusive() {
        let wf: Workflow = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(wf.steps[0].scope_mode, ScopeMode::Exclusive);
    }

    #[test]
    fn test_coordination_metadata() {
        let yaml = r#"
name: coordinated
steps:
  - {id: a, name: one, actor: ai_editor}
metadata:
  coordination:
    priority: 5
    file_scope: ["src/**"]
  owner: platform-team
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.coordination_priority(), 5);
        assert_eq!(wf.coordination_file_scope(), ["src/**".to_string()]);
        let meta = wf.metadata.unwrap();
        assert_eq!(meta.extra["owner"], "platform-team");
    }

    #[test]
    fn test_phase_task_forms() {
        let yaml = r#"
name: phased
phases:
  - id: plan
    role: ipt
    tasks:
      - review-backlog
      - {id: t1, name: analyze, actor: ai_analyst}
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.phases.len(), 1);
        let bare = wf.phases[0].tasks[0].as_step();
        assert_eq!(bare.id, "review-backlog");
        assert_eq!(bare.actor, "unknown");
        let full = wf.phases[0].tasks[1].as_step();
        assert_eq!(full.actor, "ai_analyst");
    }

    #[test]
    fn test_schema_validation_flags_violation() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name", "steps"],
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "steps": {"type": "array", "minItems": 1}
            }
        });
        let validator = WorkflowSchema::compile(&schema).unwrap();

        let ok: Workflow = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(validator.validate(&ok).is_ok());

        let empty: Workflow = serde_yaml::from_str("name: x\nsteps: []").unwrap();
        assert!(validator.validate(&empty).is_err());
    }
}
