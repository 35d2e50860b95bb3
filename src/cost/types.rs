//! Cost accounting types: usage records, budgets, summaries.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Append-only record of token usage for a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
}

fn default_model() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}

impl TokenUsage {
    /// Calendar date of the record.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Daily budget enforcement configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub daily_token_limit: u64,
    pub daily_cost_limit: f64,
    pub per_workflow_limit: u64,
    /// Fraction of the daily cost limit that triggers a warning
    pub warn_threshold: f64,
}

impl Default for BudgetLimit {
    fn default() -> Self {
        Self {
            daily_token_limit: 100_000,
            daily_cost_limit: 10.0,
            per_workflow_limit: 50_000,
            warn_threshold: 0.8,
        }
    }
}

/// Projected spending against a [`BudgetLimit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub within_daily_token_limit: bool,
    pub within_daily_cost_limit: bool,
    pub within_workflow_limit: bool,
    pub current_tokens: u64,
    pub current_cost: f64,
    pub projected_tokens: u64,
    pub projected_cost: f64,
    pub warn_if_over: bool,
}

/// Budget configuration for coordinated multi-workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationBudget {
    pub total_budget: f64,
    pub per_workflow_budget: f64,
    pub emergency_reserve: f64,
    /// Pre-set per-workflow allocations, if any
    #[serde(default)]
    pub workflow_allocations: HashMap<String, f64>,
    /// Priority (1..5) -> budget weight
    #[serde(default = "default_priority_multipliers")]
    pub priority_multipliers: HashMap<u8, f64>,
}

fn default_priority_multipliers() -> HashMap<u8, f64> {
    HashMap::from([(1, 0.5), (2, 1.0), (3, 1.5), (4, 2.0), (5, 3.0)])
}

impl Default for CoordinationBudget {
    fn default() -> Self {
        Self {
            total_budget: 25.0,
            per_workflow_budget: 10.0,
            emergency_reserve: 5.0,
            workflow_allocations: HashMap::new(),
            priority_multipliers: default_priority_multipliers(),
        }
    }
}

impl CoordinationBudget {
    /// Weight for a priority level; unmapped priorities weigh 1.0.
    pub fn multiplier(&self, priority: u8) -> f64 {
        self.priority_multipliers.get(&priority).copied().unwrap_or(1.0)
    }

    /// Budget usable before the emergency reserve is touched.
    pub fn available(&self) -> f64 {
        self.total_budget - self.emergency_reserve
    }
}

/// Per-phase cost rollup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCosts {
    pub tokens: u64,
    pub cost: f64,
    pub operations: u64,
}

/// Aggregated costs for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCostSummary {
    pub workflow_id: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub operations_count: u64,
    pub success_rate: f64,
    #[serde(default)]
    pub phases: HashMap<String, PhaseCosts>,
}

/// Per-workflow breakdown inside a coordination summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBreakdown {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub operations_count: u64,
    #[serde(default)]
    pub phases: HashMap<String, PhaseCosts>,
}

/// Aggregated costs for one coordination session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSummary {
    pub coordination_id: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_operations: u64,
    pub workflows: HashMap<String, WorkflowBreakdown>,
    pub average_cost_per_workflow: f64,
}

/// Daily usage rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub operation_count: u64,
}

/// Per-workflow budget position within a coordination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBudgetStatus {
    pub allocated: f64,
    pub used: f64,
    pub remaining: f64,
    pub utilization: f64,
    pub within_budget: bool,
}

/// Coordination-wide budget position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationBudgetStatus {
    pub coordination_id: String,
    pub total_budget: f64,
    pub emergency_reserve: f64,
    pub available_budget: f64,
    pub used_budget: f64,
    pub remaining_budget: f64,
    pub budget_utilization: f64,
    pub within_budget: bool,
    pub emergency_triggered: bool,
    pub workflows: HashMap<String, WorkflowBudgetStatus>,
}
