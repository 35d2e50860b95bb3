//! Execution context threaded between workflow steps.

use crate::workflow::{Policy, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Snapshot of a completed step visible to subsequent steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Mutable context owned by the coordinator for one workflow run.
///
/// Adapters receive a read-only view; the executor appends a [`StepRecord`]
/// after each step so later steps can reference earlier outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow_name: String,
    pub inputs: Map<String, Value>,
    pub policy: Policy,
    pub step_results: HashMap<String, StepRecord>,
    /// Caller-supplied extra context merged at workflow start
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ExecutionContext {
    /// Build the initial context for a workflow run.
    pub fn for_workflow(workflow: &Workflow, extra: Option<Map<String, Value>>) -> Self {
        Self {
            workflow_name: workflow.name.clone(),
            inputs: workflow.inputs.clone(),
            policy: workflow.policy.clone(),
            step_results: HashMap::new(),
            extra: extra.unwrap_or_default(),
        }
    }

    /// Record a completed step under its id.
    pub fn record_step(&mut self, step_id: &str, record: StepRecord) {
        self.step_results.insert(step_id.to_string(), record);
    }

    /// Look up a prior step result.
    pub fn step_result(&self, step_id: &str) -> Option<&StepRecord> {
        self.step_results.get(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_records_steps() {
        let workflow = Workflow {
            name: "wf".into(),
            ..Workflow::default()
        };
        let mut ctx = ExecutionContext::for_workflow(&workflow, None);
        assert!(ctx.step_result("a").is_none());

        ctx.record_step(
            "a",
            StepRecord {
                success: true,
                output: "done".into(),
                artifacts: vec!["artifacts/report.json".into()],
                metadata: Map::new(),
            },
        );
        let record = ctx.step_result("a").unwrap();
        assert!(record.success);
        assert_eq!(record.artifacts.len(), 1);
    }

    #[test]
    fn test_extra_context_merged() {
        let workflow = Workflow {
            name: "wf".into(),
            ..Workflow::default()
        };
        let mut extra = Map::new();
        extra.insert("branch".into(), Value::String("main".into()));
        let ctx = ExecutionContext::for_workflow(&workflow, Some(extra));
        assert_eq!(ctx.extra["branch"], "main");
    }
}
