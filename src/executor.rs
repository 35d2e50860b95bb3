//! Single-step execution with validation, dry-run, timing, and cost capture.

use crate::adapter::AdapterResult;
use crate::context::{ExecutionContext, StepRecord};
use crate::cost::CostTracker;
use crate::routing::Router;
use crate::workflow::Step;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Immutable record of one step execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<String>,
    pub tokens_used: u64,
    pub execution_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepExecutionResult {
    fn failure(step_id: &str, error: impl Into<String>, started: Instant) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            error: Some(error.into()),
            execution_time_seconds: started.elapsed().as_secs_f64(),
            ..Self::default()
        }
    }

    /// Context-visible snapshot of this result.
    pub fn as_record(&self) -> StepRecord {
        StepRecord {
            success: self.success,
            output: self.output.clone(),
            artifacts: self.artifacts.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// One issue found while validating steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepValidationIssue {
    pub step_id: String,
    pub message: String,
}

/// Result of validating a list of steps without executing them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepValidationReport {
    pub valid: bool,
    pub total_steps: usize,
    pub errors: Vec<StepValidationIssue>,
    pub warnings: Vec<StepValidationIssue>,
}

/// Executes individual workflow steps through adapters.
pub struct StepExecutor {
    router: Arc<Router>,
    cost_tracker: Option<Arc<CostTracker>>,
    dry_run: bool,
}

impl StepExecutor {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            cost_tracker: None,
            dry_run: false,
        }
    }

    pub fn with_cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    /// Dry-run executors validate wiring without invoking adapters.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Execute one step.
    ///
    /// Failures of any kind - missing fields, unknown or unavailable
    /// adapters, adapter panics, timeouts - are returned as failed results,
    /// never raised.
    pub async fn execute_step(
        &self,
        step: &Step,
        context: &ExecutionContext,
        files: Option<&str>,
    ) -> StepExecutionResult {
        let started = Instant::now();
        let step_id = if step.id.is_empty() { "unknown" } else { &step.id };

        if let Err(message) = validate_required_fields(step) {
            return StepExecutionResult::failure(step_id, message, started);
        }

        let adapter = match self.router.registry().get(&step.actor) {
            Ok(adapter) => adapter,
            Err(e) => return StepExecutionResult::failure(step_id, e.to_string(), started),
        };
        if !adapter.is_available() {
            return StepExecutionResult::failure(
                step_id,
                format!("Adapter '{}' is not available", step.actor),
                started,
            );
        }

        if self.dry_run {
            debug!(step = step_id, actor = %step.actor, "dry run");
            let mut metadata = Map::new();
            metadata.insert("dry_run".into(), json!(true));
            return StepExecutionResult {
                step_id: step_id.to_string(),
                success: true,
                output: format!("[DRY RUN] Would execute {}", step.actor),
                artifacts: step.emits.clone(),
                tokens_used: 0,
                execution_time_seconds: started.elapsed().as_secs_f64(),
                error: None,
                metadata,
            };
        }

        // The adapter runs in its own task so a panicking adapter is
        // isolated and a timed-out one can be aborted.
        let task = {
            let adapter = adapter.clone();
            let step = step.clone();
            let context = context.clone();
            let files = files.map(str::to_string);
            tokio::spawn(async move { adapter.execute(&step, &context, files.as_deref()).await })
        };

        let outcome: Result<AdapterResult, String> = match step.timeout_seconds() {
            Some(seconds) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(Duration::from_secs(seconds), task).await {
                    Ok(joined) => join_outcome(joined),
                    Err(_) => {
                        abort.abort();
                        Err("timeout".to_string())
                    }
                }
            }
            None => join_outcome(task.await),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(message) => {
                return StepExecutionResult::failure(step_id, message, started);
            }
        };

        if result.tokens_used > 0 {
            if let Some(tracker) = &self.cost_tracker {
                if let Err(e) = tracker.add_tokens(&step.actor, result.tokens_used, result.model())
                {
                    // Cost persistence is best-effort and never fails a step.
                    warn!(step = step_id, error = %e, "failed to record token usage");
                }
            }
        }

        let execution_time = started.elapsed().as_secs_f64();
        self.router
            .record_execution(&step.actor, execution_time, result.success, result.tokens_used);

        StepExecutionResult {
            step_id: step_id.to_string(),
            success: result.success,
            output: result.output,
            artifacts: result.artifacts,
            tokens_used: result.tokens_used,
            execution_time_seconds: execution_time,
            error: result.error,
            metadata: result.metadata,
        }
    }

    /// Execute steps sequentially, threading results through the context so
    /// later steps can reference earlier outputs.
    pub async fn execute_batch(
        &self,
        steps: &[Step],
        context: &mut ExecutionContext,
        files: Option<&str>,
    ) -> Vec<StepExecutionResult> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let result = self.execute_step(step, context, files).await;
            context.record_step(&result.step_id, result.as_record());
            results.push(result);
        }
        results
    }

    /// Token estimate for a step without executing it.
    pub fn estimate_step_cost(&self, step: &Step) -> u64 {
        self.router.estimate_step_cost(step)
    }

    /// Validate steps without executing: required fields, resolvable actors,
    /// current availability.
    pub fn validate_steps(&self, steps: &[Step]) -> StepValidationReport {
        let mut report = StepValidationReport {
            total_steps: steps.len(),
            ..StepValidationReport::default()
        };

        for (i, step) in steps.iter().enumerate() {
            let step_id = if step.id.is_empty() {
                format!("step_{}", i)
            } else {
                step.id.clone()
            };

            if let Err(message) = validate_required_fields(step) {
                report.errors.push(StepValidationIssue { step_id, message });
                continue;
            }

            match self.router.registry().get(&step.actor) {
                Err(_) => report.errors.push(StepValidationIssue {
                    step_id,
                    message: format!("Adapter '{}' not found", step.actor),
                }),
                Ok(adapter) if !adapter.is_available() => {
                    report.warnings.push(StepValidationIssue {
                        step_id,
                        message: format!("Adapter '{}' is not currently available", step.actor),
                    });
                }
                Ok(_) => {}
            }
        }

        report.valid = report.errors.is_empty();
        report
    }
}

fn validate_required_fields(step: &Step) -> Result<(), String> {
    for (field, value) in [("id", &step.id), ("name", &step.name), ("actor", &step.actor)] {
        if value.is_empty() {
            return Err(format!("Step missing required field: {}", field));
        }
    }
    Ok(())
}

fn join_outcome(
    joined: Result<AdapterResult, tokio::task::JoinError>,
) -> Result<AdapterResult, String> {
    match joined {
        Ok(result) => Ok(result),
        Err(e) if e.is_panic() => Err(format!("adapter panicked: {}", panic_message(e))),
        Err(_) => Err("adapter task cancelled".to_string()),
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}
