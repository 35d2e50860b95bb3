//! Top-level workflow execution loop.
//!
//! The coordinator owns the workflow document, the mutable execution
//! context, and the aggregated result. Every failure mode - unreadable
//! documents, schema violations, failing steps - is folded into the returned
//! [`WorkflowResult`]; nothing escapes as an error.

use crate::context::ExecutionContext;
use crate::executor::{StepExecutionResult, StepExecutor, StepValidationReport};
use crate::routing::MAX_PARALLEL_AI;
use crate::workflow::{Workflow, WorkflowSchema};
use crate::adapter::AdapterKind;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// Aggregated result of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub success: bool,
    pub steps_executed: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub total_tokens: u64,
    pub total_execution_time_seconds: f64,
    pub step_results: Vec<StepExecutionResult>,
    /// Step artifacts concatenated in execution order
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WorkflowResult {
    fn load_failure(workflow_name: &str, error: String, started: Instant) -> Self {
        Self {
            workflow_name: workflow_name.to_string(),
            success: false,
            error: Some(error),
            total_execution_time_seconds: started.elapsed().as_secs_f64(),
            ..Self::default()
        }
    }
}

/// Per-step line of a cost estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEstimate {
    pub step_id: String,
    pub actor: String,
    pub estimated_tokens: u64,
}

/// Workflow cost estimate without execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub workflow_name: String,
    pub total_steps: usize,
    pub total_estimated_tokens: u64,
    pub step_estimates: Vec<StepEstimate>,
}

/// Validation report for a workflow file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowValidationReport {
    pub valid: bool,
    pub workflow_name: String,
    pub total_steps: usize,
    pub steps: StepValidationReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orchestrates multi-step workflow execution.
pub struct WorkflowCoordinator {
    executor: StepExecutor,
    schema: Option<WorkflowSchema>,
}

impl WorkflowCoordinator {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            executor,
            schema: None,
        }
    }

    /// Validate loaded documents against a compiled JSON schema before
    /// executing them.
    pub fn with_schema(mut self, schema: WorkflowSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Execute a workflow file.
    pub async fn run_file(
        &self,
        path: impl AsRef<Path>,
        files: Option<&str>,
        extra_context: Option<Map<String, Value>>,
    ) -> WorkflowResult {
        let started = Instant::now();
        let path = path.as_ref();
        let fallback_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed_workflow".to_string());

        match Workflow::from_path(path) {
            Ok(workflow) => self.run(&workflow, files, extra_context).await,
            Err(e) => WorkflowResult::load_failure(&fallback_name, e.to_string(), started),
        }
    }

    /// Execute a workflow from an already-parsed document value.
    pub async fn run_value(
        &self,
        value: Value,
        files: Option<&str>,
        extra_context: Option<Map<String, Value>>,
    ) -> WorkflowResult {
        let started = Instant::now();
        match Workflow::from_value(value) {
            Ok(workflow) => self.run(&workflow, files, extra_context).await,
            Err(e) => WorkflowResult::load_failure("unnamed_workflow", e.to_string(), started),
        }
    }

    /// Execute a loaded workflow: validate, run steps in declared order,
    /// stop at the first failure when policy says fail-fast, aggregate.
    pub async fn run(
        &self,
        workflow: &Workflow,
        files: Option<&str>,
        extra_context: Option<Map<String, Value>>,
    ) -> WorkflowResult {
        let started = Instant::now();

        if let Err(e) = self.validate_document(workflow) {
            return WorkflowResult::load_failure(&workflow.name, e.to_string(), started);
        }

        let mut context = ExecutionContext::for_workflow(workflow, extra_context);
        let mut step_results = Vec::new();

        info!(workflow = %workflow.name, steps = workflow.steps.len(), "starting workflow");
        for step in &workflow.steps {
            let result = self.executor.execute_step(step, &context, files).await;
            context.record_step(&result.step_id, result.as_record());
            let failed = !result.success;
            step_results.push(result);

            if failed && workflow.policy.fail_fast {
                warn!(workflow = %workflow.name, step = %step.id, "failing fast");
                break;
            }
        }

        self.aggregate(workflow, step_results, started)
    }

    /// Execute a workflow through the router's parallel plan.
    ///
    /// Groups run sequentially; members of a group run concurrently, with AI
    /// members sharing a semaphore capped at [`MAX_PARALLEL_AI`]. Fail-fast
    /// applies between groups, never inside one.
    pub async fn run_plan(
        &self,
        workflow: &Workflow,
        files: Option<&str>,
        extra_context: Option<Map<String, Value>>,
    ) -> WorkflowResult {
        let started = Instant::now();

        if let Err(e) = self.validate_document(workflow) {
            return WorkflowResult::load_failure(&workflow.name, e.to_string(), started);
        }

        let router = self.executor.router();
        let plan = router.plan_parallel_steps(&workflow.steps, Some(&workflow.policy));
        let ai_slots = Arc::new(Semaphore::new(MAX_PARALLEL_AI));

        let mut context = ExecutionContext::for_workflow(workflow, extra_context);
        let mut indexed_results: Vec<(usize, StepExecutionResult)> = Vec::new();

        'groups: for group in &plan.execution_groups {
            let futures: Vec<_> = group
                .iter()
                .map(|&index| {
                    let step = &workflow.steps[index];
                    let is_ai = plan.decisions[index].adapter_kind == AdapterKind::Ai;
                    let slots = ai_slots.clone();
                    let context = &context;
                    async move {
                        let _permit = if is_ai {
                            Some(slots.acquire_owned().await.expect("semaphore closed"))
                        } else {
                            None
                        };
                        (index, self.executor.execute_step(step, context, files).await)
                    }
                })
                .collect();

            let mut group_results = futures::future::join_all(futures).await;
            // Context updates land in step order regardless of completion
            // order inside the group.
            group_results.sort_by_key(|(index, _)| *index);

            let mut group_failed = false;
            for (index, result) in group_results {
                context.record_step(&result.step_id, result.as_record());
                group_failed |= !result.success;
                indexed_results.push((index, result));
            }
            if group_failed && workflow.policy.fail_fast {
                warn!(workflow = %workflow.name, "failing fast after group failure");
                break 'groups;
            }
        }

        indexed_results.sort_by_key(|(index, _)| *index);
        let step_results = indexed_results.into_iter().map(|(_, r)| r).collect();
        self.aggregate(workflow, step_results, started)
    }

    /// Estimate total token cost for a workflow file without executing it.
    pub fn estimate_cost_file(&self, path: impl AsRef<Path>) -> Result<CostEstimate> {
        let workflow = Workflow::from_path(path)?;
        Ok(self.estimate_cost(&workflow))
    }

    /// Estimate total token cost for a loaded workflow.
    pub fn estimate_cost(&self, workflow: &Workflow) -> CostEstimate {
        let step_estimates: Vec<StepEstimate> = workflow
            .steps
            .iter()
            .map(|step| StepEstimate {
                step_id: step.id.clone(),
                actor: step.actor.clone(),
                estimated_tokens: self.executor.estimate_step_cost(step),
            })
            .collect();

        CostEstimate {
            workflow_name: workflow.name.clone(),
            total_steps: workflow.steps.len(),
            total_estimated_tokens: step_estimates.iter().map(|e| e.estimated_tokens).sum(),
            step_estimates,
        }
    }

    /// Validate a workflow file without executing it.
    pub fn validate_file(&self, path: impl AsRef<Path>) -> WorkflowValidationReport {
        let workflow = match Workflow::from_path(path) {
            Ok(workflow) => workflow,
            Err(e) => {
                return WorkflowValidationReport {
                    valid: false,
                    error: Some(e.to_string()),
                    ..WorkflowValidationReport::default()
                }
            }
        };

        if let Err(e) = self.validate_document(&workflow) {
            return WorkflowValidationReport {
                valid: false,
                workflow_name: workflow.name.clone(),
                total_steps: workflow.steps.len(),
                error: Some(e.to_string()),
                ..WorkflowValidationReport::default()
            };
        }

        let steps = self.executor.validate_steps(&workflow.steps);
        WorkflowValidationReport {
            valid: steps.valid,
            workflow_name: workflow.name.clone(),
            total_steps: workflow.steps.len(),
            steps,
            error: None,
        }
    }

    fn validate_document(&self, workflow: &Workflow) -> Result<()> {
        workflow.validate_structure()?;
        if let Some(schema) = &self.schema {
            schema.validate(workflow)?;
        }
        Ok(())
    }

    fn aggregate(
        &self,
        workflow: &Workflow,
        step_results: Vec<StepExecutionResult>,
        started: Instant,
    ) -> WorkflowResult {
        let steps_succeeded = step_results.iter().filter(|r| r.success).count();
        let steps_failed = step_results.len() - steps_succeeded;
        let total_tokens = step_results.iter().map(|r| r.tokens_used).sum();
        let artifacts: Vec<String> = step_results
            .iter()
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect();

        let mut metadata = workflow
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_value(m).ok())
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        metadata.insert("run_id".into(), json!(Uuid::new_v4().to_string()));

        WorkflowResult {
            workflow_name: workflow.name.clone(),
            success: steps_failed == 0,
            steps_executed: step_results.len(),
            steps_succeeded,
            steps_failed,
            total_tokens,
            total_execution_time_seconds: started.elapsed().as_secs_f64(),
            step_results,
            artifacts,
            error: None,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedAdapter;
    use crate::adapter::{AdapterRegistry, AdapterResult};
    use crate::routing::Router;
    use crate::workflow::{Policy, Step};
    use std::sync::Arc;

    struct Fixture {
        coordinator: WorkflowCoordinator,
        fixer: Arc<ScriptedAdapter>,
        breaker: Arc<ScriptedAdapter>,
        editor: Arc<ScriptedAdapter>,
    }

    fn fixture() -> Fixture {
        let fixer = Arc::new(ScriptedAdapter::deterministic("fixer"));
        let breaker = Arc::new(ScriptedAdapter::deterministic("breaker").failing("boom"));
        let editor = Arc::new(ScriptedAdapter::ai("editor", 700));

        let registry = AdapterRegistry::new();
        registry.register(fixer.clone());
        registry.register(breaker.clone());
        registry.register(editor.clone());

        let executor = StepExecutor::new(Arc::new(Router::new(Arc::new(registry))));
        Fixture {
            coordinator: WorkflowCoordinator::new(executor),
            fixer,
            breaker,
            editor,
        }
    }

    fn step(id: &str, actor: &str) -> Step {
        Step {
            id: id.into(),
            name: format!("run {}", actor),
            actor: actor.into(),
            ..Step::default()
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "wf".into(),
            steps,
            ..Workflow::default()
        }
    }

    #[tokio::test]
    async fn test_successful_run_aggregates_counters_and_tokens() {
        let f = fixture();
        let wf = workflow(vec![step("a", "fixer"), step("b", "editor")]);

        let result = f.coordinator.run(&wf, None, None).await;
        assert!(result.success);
        assert_eq!(result.steps_executed, 2);
        assert_eq!(result.steps_succeeded, 2);
        assert_eq!(result.steps_failed, 0);
        // Token invariant: workflow total equals the per-step sum.
        let step_sum: u64 = result.step_results.iter().map(|r| r.tokens_used).sum();
        assert_eq!(result.total_tokens, step_sum);
        assert_eq!(result.total_tokens, 700);
        assert!(result.metadata.contains_key("run_id"));
    }

    #[tokio::test]
    async fn test_fail_fast_halts_remaining_steps() {
        let f = fixture();
        let wf = workflow(vec![
            step("a", "fixer"),
            step("b", "breaker"),
            step("c", "fixer"),
        ]);

        let result = f.coordinator.run(&wf, None, None).await;
        assert!(!result.success);
        assert_eq!(result.steps_executed, 2);
        assert_eq!(result.steps_succeeded, 1);
        assert_eq!(result.steps_failed, 1);
        // The third step never ran.
        assert_eq!(f.fixer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_disabled_runs_everything() {
        let f = fixture();
        let mut wf = workflow(vec![
            step("a", "fixer"),
            step("b", "breaker"),
            step("c", "fixer"),
        ]);
        wf.policy = Policy {
            fail_fast: false,
            ..Policy::default()
        };

        let result = f.coordinator.run(&wf, None, None).await;
        assert_eq!(result.steps_executed, 3);
        assert_eq!(result.steps_succeeded, 2);
        // Success still reflects the failed step.
        assert!(!result.success);
        assert_eq!(f.fixer.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_steps_produce_load_failure_result() {
        let f = fixture();
        let wf = workflow(vec![]);

        let result = f.coordinator.run(&wf, None, None).await;
        assert!(!result.success);
        assert_eq!(result.steps_executed, 0);
        assert!(result.error.as_deref().unwrap().contains("at least one step"));
    }

    #[tokio::test]
    async fn test_missing_file_produces_load_failure_result() {
        let f = fixture();
        let result = f
            .coordinator
            .run_file("/no/such/workflow.yaml", None, None)
            .await;
        assert!(!result.success);
        assert_eq!(result.workflow_name, "workflow");
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_schema_violation_blocks_execution() {
        let f = fixture();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"name": {"const": "approved-name"}},
        });
        let coordinator =
            WorkflowCoordinator::new(StepExecutor::new(f.coordinator.executor().router().clone()))
                .with_schema(WorkflowSchema::compile(&schema).unwrap());

        let wf = workflow(vec![step("a", "fixer")]);
        let result = coordinator.run(&wf, None, None).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(f.fixer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_passes_through() {
        let f = fixture();
        let registry = f.coordinator.executor().router().registry().clone();
        let executor =
            StepExecutor::new(Arc::new(Router::new(registry))).dry_run(true);
        let coordinator = WorkflowCoordinator::new(executor);

        let wf = workflow(vec![step("1.001", "fixer")]);
        let result = coordinator.run(&wf, None, None).await;

        assert!(result.success);
        assert_eq!(result.steps_executed, 1);
        assert_eq!(result.steps_succeeded, 1);
        assert_eq!(result.total_tokens, 0);
        assert!(result.artifacts.is_empty());
        assert!(result.step_results[0].output.starts_with("[DRY RUN]"));
        assert_eq!(f.fixer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_artifacts_concatenate_in_order() {
        let registry = AdapterRegistry::new();
        let mut first = ScriptedAdapter::deterministic("first");
        first.result = AdapterResult::ok("one").with_artifacts(vec!["a1".into(), "a2".into()]);
        let mut second = ScriptedAdapter::deterministic("second");
        second.result = AdapterResult::ok("two").with_artifacts(vec!["b1".into()]);
        registry.register(Arc::new(first));
        registry.register(Arc::new(second));

        let coordinator = WorkflowCoordinator::new(StepExecutor::new(Arc::new(Router::new(
            Arc::new(registry),
        ))));
        let wf = workflow(vec![step("a", "first"), step("b", "second")]);

        let result = coordinator.run(&wf, None, None).await;
        assert_eq!(result.artifacts, vec!["a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn test_estimate_cost_sums_step_estimates() {
        let f = fixture();
        let wf = workflow(vec![step("a", "fixer"), step("b", "editor"), step("c", "editor")]);

        let estimate = f.coordinator.estimate_cost(&wf);
        assert_eq!(estimate.total_steps, 3);
        assert_eq!(estimate.total_estimated_tokens, 1400);
        assert_eq!(estimate.step_estimates[0].estimated_tokens, 0);
        assert_eq!(estimate.step_estimates[1].estimated_tokens, 700);
    }

    #[tokio::test]
    async fn test_validate_file_reports_structure_and_steps() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.yaml");
        std::fs::write(
            &good,
            "name: ok\nsteps:\n  - {id: a, name: fix, actor: fixer}\n",
        )
        .unwrap();
        let report = f.coordinator.validate_file(&good);
        assert!(report.valid);
        assert_eq!(report.total_steps, 1);

        let bad = dir.path().join("bad.yaml");
        std::fs::write(
            &bad,
            "name: broken\nsteps:\n  - {id: a, name: fix, actor: ghost}\n",
        )
        .unwrap();
        let report = f.coordinator.validate_file(&bad);
        assert!(!report.valid);
        assert_eq!(report.steps.errors.len(), 1);

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "name: hollow\nsteps: []\n").unwrap();
        let report = f.coordinator.validate_file(&empty);
        assert!(!report.valid);
        assert!(report.error.as_deref().unwrap().contains("at least one step"));
    }

    #[tokio::test]
    async fn test_run_value_executes_parsed_documents() {
        let f = fixture();
        let doc = serde_json::json!({
            "name": "from-value",
            "steps": [{"id": "a", "name": "fix", "actor": "fixer"}]
        });
        let result = f.coordinator.run_value(doc, None, None).await;
        assert!(result.success);
        assert_eq!(result.workflow_name, "from-value");
    }

    #[tokio::test]
    async fn test_run_plan_executes_groups_and_respects_fail_fast() {
        let f = fixture();
        let mut wf = workflow(vec![
            step("a", "breaker"),
            step("b", "fixer"),
            step("c", "editor"),
        ]);
        wf.policy = Policy {
            prefer_deterministic: false,
            ..Policy::default()
        };

        let result = f.coordinator.run_plan(&wf, None, None).await;
        // Group 1 is the deterministic pair (one of them fails); fail-fast
        // stops before the AI group.
        assert!(!result.success);
        assert_eq!(result.steps_executed, 2);
        assert_eq!(result.steps_failed, 1);
        assert_eq!(f.editor.call_count(), 0);
        assert_eq!(f.breaker.call_count(), 1);
    }
}
