//! Adapter contract shared by every work unit the orchestrator can invoke.
//!
//! An adapter is either a deterministic tool (linter, test runner, git
//! operation) or an AI-backed actor. Both expose the same four operations so
//! the router, executor, and coordinator never special-case one kind.

mod builtin;
mod registry;

pub use builtin::{
    AiAnalystAdapter, AiEditorAdapter, CodeFixersAdapter, GitOpsAdapter, PytestRunnerAdapter,
    VscodeDiagnosticsAdapter,
};
pub use registry::{AdapterFactory, AdapterRegistry, ConstructorFn, PluginLoader, PluginSpec};

use crate::context::ExecutionContext;
use crate::workflow::Step;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Kind of work an adapter performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Repeatable tool with no model calls; reports zero token cost
    Deterministic,
    /// AI-backed actor with token-metered cost
    Ai,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Ai => "ai",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one adapter invocation.
///
/// Adapters must not fail past their boundary: internal errors are reported
/// as `success == false` with `error` populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterResult {
    pub success: bool,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AdapterResult {
    /// Successful result with output text.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Failed result with a diagnostic.
    pub fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Model name recorded by the adapter, if any.
    pub fn model(&self) -> Option<&str> {
        self.metadata.get("model").and_then(Value::as_str)
    }
}

/// Static performance characteristics advertised by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// Max complexity score this adapter handles well
    pub complexity_threshold: f64,
    pub preferred_file_types: Vec<String>,
    /// Maximum files processed efficiently
    pub max_files: usize,
    /// Maximum total file size in bytes
    pub max_file_size: u64,
    pub avg_execution_time: f64,
    pub success_rate: f64,
    /// Typical tokens per operation (0 for deterministic tools)
    pub cost_efficiency: f64,
    pub parallel_capable: bool,
    pub requires_network: bool,
    pub requires_api_key: bool,
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            complexity_threshold: 0.5,
            preferred_file_types: vec!["*".to_string()],
            max_files: 100,
            max_file_size: 1_000_000,
            avg_execution_time: 1.0,
            success_rate: 1.0,
            cost_efficiency: 1.0,
            parallel_capable: true,
            requires_network: false,
            requires_api_key: false,
        }
    }
}

/// Read-only adapter metadata for enumeration and routing.
///
/// Descriptors can exist without a constructed adapter: lazily registered
/// entries advertise a conservative default until first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub kind: AdapterKind,
    pub description: String,
    /// Base token estimate for an empty step
    pub cost: u64,
    pub available: bool,
    pub profile: PerformanceProfile,
}

impl AdapterDescriptor {
    /// Descriptor for a lazily registered, not-yet-constructed adapter.
    pub fn lazy_default(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AdapterKind::Deterministic,
            description: format!("Adapter: {}", name),
            cost: 0,
            available: true,
            profile: PerformanceProfile::default(),
        }
    }
}

/// Uniform contract for all work units.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter key, unique within a registry.
    fn name(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    fn description(&self) -> &str;

    fn performance_profile(&self) -> PerformanceProfile {
        PerformanceProfile::default()
    }

    /// Perform the step's work.
    ///
    /// Implementations report failures through the result; they must not
    /// panic past this boundary.
    async fn execute(
        &self,
        step: &Step,
        context: &ExecutionContext,
        files: Option<&str>,
    ) -> AdapterResult;

    /// Structural pre-flight over the step's `with` parameters.
    fn validate_step(&self, step: &Step) -> bool;

    /// Conservative upper-bound token estimate; zero for deterministic tools.
    fn estimate_cost(&self, _step: &Step) -> u64 {
        0
    }

    /// Fast, side-effect-free environment check (binaries, keys, network).
    fn is_available(&self) -> bool {
        true
    }

    /// Metadata snapshot for routing and listings.
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: self.name().to_string(),
            kind: self.kind(),
            description: self.description().to_string(),
            cost: self.estimate_cost(&Step::default()),
            available: self.is_available(),
            profile: self.performance_profile(),
        }
    }
}

/// Shared handle to an adapter.
pub type AdapterRef = Arc<dyn Adapter>;

impl std::fmt::Debug for dyn Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter").field("name", &self.name()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_builders() {
        let ok = AdapterResult::ok("done")
            .with_tokens(42)
            .with_artifacts(vec!["artifacts/a.json".into()])
            .with_metadata("model", Value::String("claude-3".into()));
        assert!(ok.success);
        assert_eq!(ok.tokens_used, 42);
        assert_eq!(ok.model(), Some("claude-3"));

        let fail = AdapterResult::fail("boom");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("boom"));
        assert_eq!(fail.tokens_used, 0);
    }

    #[test]
    fn test_lazy_descriptor_defaults_deterministic_available() {
        let d = AdapterDescriptor::lazy_default("code_fixers");
        assert_eq!(d.kind, AdapterKind::Deterministic);
        assert!(d.available);
        assert_eq!(d.cost, 0);
    }
}
