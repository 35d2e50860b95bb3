//! Token-usage recording and budget evaluation.

use super::calculator::CostCalculator;
use super::storage::CostStorage;
use super::types::{
    BudgetCheck, BudgetLimit, CoordinationBudget, CoordinationBudgetStatus, CoordinationSummary,
    DailyUsage, PhaseCosts, TokenUsage, WorkflowBreakdown, WorkflowBudgetStatus,
    WorkflowCostSummary,
};
use crate::error::Result;
use crate::workflow::Workflow;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Flat per-token rate used when projecting spend without a known model.
const PROJECTION_RATE: f64 = 1e-5;

/// Optional attribution attached to a usage record.
#[derive(Debug, Clone, Default)]
pub struct UsageScope {
    pub workflow_id: Option<String>,
    pub coordination_id: Option<String>,
    pub phase_id: Option<String>,
    pub adapter_name: Option<String>,
    pub failed: bool,
}

impl UsageScope {
    pub fn workflow(id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn coordination(mut self, id: impl Into<String>) -> Self {
        self.coordination_id = Some(id.into());
        self
    }

    pub fn phase(mut self, id: impl Into<String>) -> Self {
        self.phase_id = Some(id.into());
        self
    }

    pub fn adapter(mut self, name: impl Into<String>) -> Self {
        self.adapter_name = Some(name.into());
        self
    }
}

/// Records token usage through a storage port and evaluates budgets.
pub struct CostTracker {
    storage: Arc<dyn CostStorage>,
    calculator: CostCalculator,
}

impl CostTracker {
    pub fn new(storage: Arc<dyn CostStorage>) -> Self {
        Self {
            storage,
            calculator: CostCalculator::new(),
        }
    }

    pub fn with_calculator(storage: Arc<dyn CostStorage>, calculator: CostCalculator) -> Self {
        Self {
            storage,
            calculator,
        }
    }

    pub fn calculator(&self) -> &CostCalculator {
        &self.calculator
    }

    /// Record one operation's token usage; returns the estimated USD cost.
    pub fn record_usage(
        &self,
        operation: &str,
        tokens_used: u64,
        model: Option<&str>,
        scope: UsageScope,
    ) -> Result<f64> {
        let model = model.unwrap_or("unknown");
        let estimated_cost = self.calculator.estimate(model, tokens_used);
        let usage = TokenUsage {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            tokens_used,
            estimated_cost,
            model: model.to_string(),
            success: !scope.failed,
            workflow_id: scope.workflow_id,
            coordination_id: scope.coordination_id,
            phase_id: scope.phase_id,
            adapter_name: scope.adapter_name,
        };
        self.storage.save(&usage)?;
        debug!(operation, tokens_used, cost = estimated_cost, "recorded usage");
        Ok(estimated_cost)
    }

    /// Shorthand used by the executor after each metered step.
    pub fn add_tokens(&self, operation: &str, tokens_used: u64, model: Option<&str>) -> Result<f64> {
        self.record_usage(operation, tokens_used, model, UsageScope::default())
    }

    /// Token and cost totals for one date (today when `None`).
    pub fn daily_usage(&self, date: Option<NaiveDate>) -> Result<DailyUsage> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let records = self.storage.load_by_date(date)?;
        Ok(DailyUsage {
            date,
            total_tokens: records.iter().map(|r| r.tokens_used).sum(),
            total_cost: records.iter().map(|r| r.estimated_cost).sum(),
            operation_count: records.len() as u64,
        })
    }

    /// Project spending `tokens_to_spend` against today's usage.
    pub fn check_budget(&self, budget: &BudgetLimit, tokens_to_spend: u64) -> Result<BudgetCheck> {
        let today = self.daily_usage(None)?;
        let projected_tokens = today.total_tokens + tokens_to_spend;
        let projected_cost = today.total_cost + tokens_to_spend as f64 * PROJECTION_RATE;

        Ok(BudgetCheck {
            within_daily_token_limit: projected_tokens <= budget.daily_token_limit,
            within_daily_cost_limit: projected_cost <= budget.daily_cost_limit,
            within_workflow_limit: tokens_to_spend <= budget.per_workflow_limit,
            current_tokens: today.total_tokens,
            current_cost: today.total_cost,
            projected_tokens,
            projected_cost,
            warn_if_over: projected_cost >= budget.daily_cost_limit * budget.warn_threshold,
        })
    }

    /// Allocate a coordination budget across workflows.
    ///
    /// Shares are proportional to `priority multiplier x complexity factor`,
    /// capped per workflow, and never exceed the budget minus the emergency
    /// reserve. Zero total score distributes evenly.
    pub fn allocate_budget(
        &self,
        workflows: &[Workflow],
        budget: &CoordinationBudget,
    ) -> HashMap<String, f64> {
        let remaining = budget.available();
        let mut scores: Vec<(String, f64)> = Vec::with_capacity(workflows.len());
        let mut total_score = 0.0;

        for workflow in workflows {
            let multiplier = budget.multiplier(workflow.coordination_priority());
            let score = multiplier * workflow_complexity_factor(workflow);
            total_score += score;
            scores.push((workflow.name.clone(), score));
        }

        if total_score <= 0.0 {
            let per = remaining / workflows.len().max(1) as f64;
            return scores
                .into_iter()
                .map(|(name, _)| (name, f64::min(per, budget.per_workflow_budget)))
                .collect();
        }

        scores
            .into_iter()
            .map(|(name, score)| {
                let share = score / total_score * remaining;
                (name, f64::min(share, budget.per_workflow_budget))
            })
            .collect()
    }

    /// Aggregate all records for one coordination session.
    pub fn coordination_summary(&self, coordination_id: &str) -> Result<CoordinationSummary> {
        let records = self.storage.load_by_coordination(coordination_id)?;
        let mut summary = CoordinationSummary {
            coordination_id: coordination_id.to_string(),
            ..CoordinationSummary::default()
        };

        for usage in &records {
            let workflow_id = usage.workflow_id.clone().unwrap_or_else(|| "unknown".into());
            let breakdown = summary
                .workflows
                .entry(workflow_id)
                .or_insert_with(WorkflowBreakdown::default);
            breakdown.total_tokens += usage.tokens_used;
            breakdown.total_cost += usage.estimated_cost;
            breakdown.operations_count += 1;
            if let Some(phase_id) = &usage.phase_id {
                let phase = breakdown
                    .phases
                    .entry(phase_id.clone())
                    .or_insert_with(PhaseCosts::default);
                phase.tokens += usage.tokens_used;
                phase.cost += usage.estimated_cost;
                phase.operations += 1;
            }
            summary.total_tokens += usage.tokens_used;
            summary.total_cost += usage.estimated_cost;
            summary.total_operations += 1;
        }

        summary.average_cost_per_workflow =
            summary.total_cost / summary.workflows.len().max(1) as f64;
        Ok(summary)
    }

    /// Cost summary for one workflow, optionally scoped to a coordination.
    pub fn workflow_summary(
        &self,
        workflow_id: &str,
        coordination_id: Option<&str>,
    ) -> Result<WorkflowCostSummary> {
        let mut summary = WorkflowCostSummary {
            workflow_id: workflow_id.to_string(),
            ..WorkflowCostSummary::default()
        };
        let mut successful = 0u64;

        for usage in self.storage.load_all()? {
            if usage.workflow_id.as_deref() != Some(workflow_id) {
                continue;
            }
            if let Some(coordination) = coordination_id {
                if usage.coordination_id.as_deref() != Some(coordination) {
                    continue;
                }
            }
            summary.total_tokens += usage.tokens_used;
            summary.total_cost += usage.estimated_cost;
            summary.operations_count += 1;
            if usage.success {
                successful += 1;
            }
            if let Some(phase_id) = &usage.phase_id {
                let phase = summary
                    .phases
                    .entry(phase_id.clone())
                    .or_insert_with(PhaseCosts::default);
                phase.tokens += usage.tokens_used;
                phase.cost += usage.estimated_cost;
                phase.operations += 1;
            }
        }

        summary.success_rate = successful as f64 / summary.operations_count.max(1) as f64;
        Ok(summary)
    }

    /// Budget position for a coordination session.
    pub fn check_coordination_budget(
        &self,
        coordination_id: &str,
        budget: &CoordinationBudget,
    ) -> Result<CoordinationBudgetStatus> {
        let summary = self.coordination_summary(coordination_id)?;
        let mut status = CoordinationBudgetStatus {
            coordination_id: coordination_id.to_string(),
            total_budget: budget.total_budget,
            emergency_reserve: budget.emergency_reserve,
            available_budget: budget.available(),
            used_budget: summary.total_cost,
            remaining_budget: budget.total_budget - summary.total_cost,
            budget_utilization: summary.total_cost / f64::max(budget.total_budget, 1e-9),
            within_budget: summary.total_cost <= budget.total_budget,
            emergency_triggered: summary.total_cost > budget.available(),
            workflows: HashMap::new(),
        };

        for (workflow_id, breakdown) in &summary.workflows {
            let allocated = budget
                .workflow_allocations
                .get(workflow_id)
                .copied()
                .unwrap_or(budget.per_workflow_budget);
            status.workflows.insert(
                workflow_id.clone(),
                WorkflowBudgetStatus {
                    allocated,
                    used: breakdown.total_cost,
                    remaining: allocated - breakdown.total_cost,
                    utilization: if allocated > 0.0 {
                        breakdown.total_cost / allocated
                    } else {
                        0.0
                    },
                    within_budget: breakdown.total_cost <= allocated,
                },
            );
        }
        Ok(status)
    }

    /// Split the unconsumed budget evenly across still-to-run workflows.
    pub fn optimize_remaining_allocation(
        &self,
        coordination_id: &str,
        remaining_workflows: &[String],
        budget: &CoordinationBudget,
    ) -> Result<HashMap<String, f64>> {
        let summary = self.coordination_summary(coordination_id)?;
        let remaining_budget = budget.total_budget - summary.total_cost;
        let count = remaining_workflows.len().max(1) as f64;

        let per = if remaining_budget <= budget.emergency_reserve {
            budget.emergency_reserve / count
        } else {
            f64::min(
                (remaining_budget - budget.emergency_reserve) / count,
                budget.per_workflow_budget,
            )
        };
        Ok(remaining_workflows
            .iter()
            .map(|id| (id.clone(), per))
            .collect())
    }
}

/// Relative complexity of a workflow for budget weighting.
fn workflow_complexity_factor(workflow: &Workflow) -> f64 {
    let mut factor = 1.0;

    if !workflow.phases.is_empty() {
        factor += workflow.phases.len() as f64 * 0.2;
        if workflow
            .phases
            .iter()
            .any(|p| p.role.as_deref() == Some("ipt"))
        {
            factor += 0.5;
        }
    } else if !workflow.steps.is_empty() {
        factor += workflow.steps.len() as f64 * 0.1;
    }

    let ai_steps = workflow
        .steps
        .iter()
        .filter(|s| {
            s.actor.contains("ai_") || matches!(s.actor.as_str(), "claude" | "gemini" | "aider")
        })
        .count();
    factor += ai_steps as f64 * 0.3;

    if workflow.coordination_file_scope().len() > 10 {
        factor += 0.4;
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::storage::MemoryCostStorage;
    use crate::workflow::{CoordinationMeta, Policy, Step, WorkflowMetadata};
    use proptest::prelude::*;

    fn tracker() -> CostTracker {
        CostTracker::new(Arc::new(MemoryCostStorage::new()))
    }

    fn workflow(name: &str, priority: u8, steps: usize) -> Workflow {
        Workflow {
            name: name.into(),
            policy: Policy::default(),
            steps: (0..steps)
                .map(|i| Step {
                    id: format!("s{}", i),
                    name: format!("step {}", i),
                    actor: "code_fixers".into(),
                    ..Step::default()
                })
                .collect(),
            metadata: Some(WorkflowMetadata {
                coordination: Some(CoordinationMeta {
                    priority: Some(priority),
                    file_scope: Vec::new(),
                }),
                ..WorkflowMetadata::default()
            }),
            ..Workflow::default()
        }
    }

    #[test]
    fn test_record_usage_computes_cost() {
        let tracker = tracker();
        let cost = tracker
            .record_usage("edit", 1000, Some("claude-3"), UsageScope::default())
            .unwrap();
        assert_eq!(cost, 1000.0 * 0.000_08);

        // Unknown model falls back to the conservative rate.
        let cost = tracker.add_tokens("edit", 1000, None).unwrap();
        assert_eq!(cost, 0.01);

        let today = tracker.daily_usage(None).unwrap();
        assert_eq!(today.total_tokens, 2000);
        assert_eq!(today.operation_count, 2);
    }

    #[test]
    fn test_budget_check_flags_and_warning() {
        let tracker = tracker();
        tracker.add_tokens("bulk", 90_000, None).unwrap();

        let budget = BudgetLimit::default();
        let check = tracker.check_budget(&budget, 20_000).unwrap();
        assert!(!check.within_daily_token_limit);
        assert!(check.within_daily_cost_limit);
        assert!(check.within_workflow_limit);
        assert_eq!(check.projected_tokens, 110_000);

        let tight = BudgetLimit {
            daily_cost_limit: 1.0,
            warn_threshold: 0.8,
            ..BudgetLimit::default()
        };
        // 0.9 current + 0.2 projected >= 0.8 of 1.0.
        let check = tracker.check_budget(&tight, 20_000).unwrap();
        assert!(check.warn_if_over);
    }

    #[test]
    fn test_priority_weighted_allocation() {
        let tracker = tracker();
        let workflows = vec![workflow("A", 1, 2), workflow("B", 5, 2)];
        let budget = CoordinationBudget {
            total_budget: 10.0,
            per_workflow_budget: 10.0,
            emergency_reserve: 0.0,
            ..CoordinationBudget::default()
        };

        let allocations = tracker.allocate_budget(&workflows, &budget);
        assert!(allocations["A"] > 0.0);
        assert!(allocations["B"] > allocations["A"]);
        assert!(allocations["A"] + allocations["B"] <= 10.0 + 1e-9);
    }

    #[test]
    fn test_zero_scores_distribute_evenly() {
        let tracker = tracker();
        let workflows = vec![workflow("A", 2, 1), workflow("B", 2, 1)];
        let budget = CoordinationBudget {
            total_budget: 8.0,
            per_workflow_budget: 10.0,
            emergency_reserve: 2.0,
            // Zero multipliers zero out every score.
            priority_multipliers: HashMap::from([(2, 0.0)]),
            ..CoordinationBudget::default()
        };

        let allocations = tracker.allocate_budget(&workflows, &budget);
        assert_eq!(allocations["A"], 3.0);
        assert_eq!(allocations["B"], 3.0);
    }

    #[test]
    fn test_coordination_and_workflow_summaries() {
        let tracker = tracker();
        for (wf, phase, tokens) in [("alpha", "p1", 100u64), ("alpha", "p2", 200), ("beta", "p1", 50)] {
            tracker
                .record_usage(
                    "edit",
                    tokens,
                    Some("claude-3"),
                    UsageScope::workflow(wf).coordination("run-1").phase(phase),
                )
                .unwrap();
        }
        // A record outside the coordination must not leak in.
        tracker
            .record_usage("edit", 999, None, UsageScope::workflow("alpha"))
            .unwrap();

        let summary = tracker.coordination_summary("run-1").unwrap();
        assert_eq!(summary.total_operations, 3);
        assert_eq!(summary.total_tokens, 350);
        assert_eq!(summary.workflows["alpha"].total_tokens, 300);
        assert_eq!(summary.workflows["alpha"].phases["p2"].tokens, 200);

        let wf = tracker.workflow_summary("alpha", Some("run-1")).unwrap();
        assert_eq!(wf.total_tokens, 300);
        assert_eq!(wf.operations_count, 2);
        assert_eq!(wf.success_rate, 1.0);

        let unscoped = tracker.workflow_summary("alpha", None).unwrap();
        assert_eq!(unscoped.total_tokens, 1299);
    }

    #[test]
    fn test_coordination_budget_status() {
        let tracker = tracker();
        tracker
            .record_usage(
                "edit",
                100_000,
                None, // 1.0 USD at the fallback rate
                UsageScope::workflow("alpha").coordination("run-1"),
            )
            .unwrap();

        let budget = CoordinationBudget {
            total_budget: 2.0,
            per_workflow_budget: 1.5,
            emergency_reserve: 1.5,
            ..CoordinationBudget::default()
        };
        let status = tracker.check_coordination_budget("run-1", &budget).unwrap();
        assert!(status.within_budget);
        // Spend crossed into the emergency reserve (available was 0.5).
        assert!(status.emergency_triggered);
        assert_eq!(status.workflows["alpha"].allocated, 1.5);
        assert!(status.workflows["alpha"].within_budget);
    }

    #[test]
    fn test_optimize_remaining_allocation_caps_and_reserves() {
        let tracker = tracker();
        tracker
            .record_usage(
                "edit",
                100_000,
                None,
                UsageScope::workflow("done").coordination("run-1"),
            )
            .unwrap();

        let budget = CoordinationBudget {
            total_budget: 11.0,
            per_workflow_budget: 3.0,
            emergency_reserve: 2.0,
            ..CoordinationBudget::default()
        };
        let remaining = vec!["x".to_string(), "y".to_string()];
        let allocations = tracker
            .optimize_remaining_allocation("run-1", &remaining, &budget)
            .unwrap();
        // (11 - 1 used - 2 reserve) / 2 = 4, capped at 3.
        assert_eq!(allocations["x"], 3.0);
        assert_eq!(allocations["y"], 3.0);
    }

    proptest! {
        #[test]
        fn prop_allocations_respect_caps(
            priorities in proptest::collection::vec(1u8..=5, 1..6),
            total in 1.0f64..100.0,
            reserve_frac in 0.0f64..0.5,
            per_workflow in 0.5f64..50.0,
        ) {
            let tracker = tracker();
            let workflows: Vec<Workflow> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| workflow(&format!("wf{}", i), *p, i % 4 + 1))
                .collect();
            let budget = CoordinationBudget {
                total_budget: total,
                per_workflow_budget: per_workflow,
                emergency_reserve: total * reserve_frac,
                ..CoordinationBudget::default()
            };

            let allocations = tracker.allocate_budget(&workflows, &budget);
            let sum: f64 = allocations.values().sum();
            prop_assert!(sum <= budget.available() + 1e-9);
            for allocation in allocations.values() {
                prop_assert!(*allocation <= per_workflow + 1e-9);
            }
        }
    }
}
