//! Resource allocation across coordinated workflows.

use super::router::Router;
use crate::adapter::AdapterKind;
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Fixed conversion rate applied to token estimates when reporting USD.
const USD_PER_TOKEN: f64 = 0.0005 / 1000.0;

/// Adapter assignment for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub adapter: String,
    pub adapter_kind: AdapterKind,
    pub estimated_tokens: u64,
    pub priority: i64,
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Resource allocation plan for a set of coordinated workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// Unit id -> assignment
    pub assignments: HashMap<String, Assignment>,
    pub total_estimated_tokens: u64,
    pub estimated_usd_cost: f64,
    pub within_budget: bool,
    /// Workflow names grouped by coordination priority, highest first
    pub parallel_groups: Vec<Vec<String>>,
}

impl Router {
    /// Route every unit of work across workflows and check an optional USD
    /// budget. Workflows with phases are flattened phase by phase; plain
    /// workflows contribute their steps directly.
    pub fn create_allocation_plan(
        &self,
        workflows: &[Workflow],
        budget_usd: Option<f64>,
    ) -> AllocationPlan {
        let mut assignments = HashMap::new();
        let mut total_tokens = 0u64;

        for workflow in workflows {
            if !workflow.phases.is_empty() {
                for phase in &workflow.phases {
                    for task in &phase.tasks {
                        let step = task.as_step();
                        let unit_id = format!("{}_{}_{}", workflow.name, phase.id, step.id);
                        let decision = self.route_step(&step, Some(&workflow.policy));
                        total_tokens += decision.estimated_tokens;
                        assignments.insert(
                            unit_id,
                            Assignment {
                                adapter: decision.adapter_name,
                                adapter_kind: decision.adapter_kind,
                                estimated_tokens: decision.estimated_tokens,
                                priority: phase.priority.unwrap_or(1),
                                workflow: workflow.name.clone(),
                                phase: Some(phase.id.clone()),
                            },
                        );
                    }
                }
            } else {
                for step in &workflow.steps {
                    let unit_id = format!("{}_{}", workflow.name, step.id);
                    let decision = self.route_step(step, Some(&workflow.policy));
                    total_tokens += decision.estimated_tokens;
                    assignments.insert(
                        unit_id,
                        Assignment {
                            adapter: decision.adapter_name,
                            adapter_kind: decision.adapter_kind,
                            estimated_tokens: decision.estimated_tokens,
                            priority: 1,
                            workflow: workflow.name.clone(),
                            phase: None,
                        },
                    );
                }
            }
        }

        let estimated_usd_cost = total_tokens as f64 * USD_PER_TOKEN;
        let within_budget = budget_usd.map_or(true, |b| estimated_usd_cost <= b);

        AllocationPlan {
            assignments,
            total_estimated_tokens: total_tokens,
            estimated_usd_cost,
            within_budget,
            parallel_groups: priority_groups(workflows),
        }
    }
}

/// Group workflow names by coordination priority, highest priority first.
fn priority_groups(workflows: &[Workflow]) -> Vec<Vec<String>> {
    let mut by_priority: BTreeMap<u8, Vec<String>> = BTreeMap::new();
    for workflow in workflows {
        by_priority
            .entry(workflow.coordination_priority())
            .or_default()
            .push(workflow.name.clone());
    }
    by_priority.into_values().rev().collect()
}
