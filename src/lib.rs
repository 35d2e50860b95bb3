//! # stepflow-core
//!
//! A deterministic, schema-driven workflow orchestration library for
//! developer-automation pipelines. Workflows are declarative documents whose
//! steps are routed to pluggable adapters - deterministic tools (linters,
//! test runners, git operations) or AI-backed actors - picking the cheapest
//! acceptable adapter within a token budget.
//!
//! ## Core Components
//!
//! - **Workflow**: declarative document model with schema validation
//! - **Adapter**: uniform contract over heterogeneous work units, with a
//!   lazy registry/factory
//! - **Router**: complexity-driven, determinism-first adapter selection,
//!   parallel planning, and cross-workflow allocation
//! - **Executor / Coordinator**: step execution with dry-run, timeouts, and
//!   cost capture; ordered workflow runs with fail-fast aggregation
//! - **Gates**: declarative post-execution verification over artifacts
//! - **Cost**: token accounting, model pricing, and coordination budgets
//!
//! ## Example
//!
//! ```rust,ignore
//! use stepflow_core::{
//!     AdapterRegistry, Router, StepExecutor, WorkflowCoordinator,
//! };
//! use std::sync::Arc;
//!
//! let registry = Arc::new(AdapterRegistry::with_defaults());
//! let router = Arc::new(Router::new(registry));
//! let coordinator = WorkflowCoordinator::new(StepExecutor::new(router));
//!
//! let result = coordinator.run_file("workflow.yaml", None, None).await;
//! println!("{}: {} steps", result.workflow_name, result.steps_executed);
//! ```

pub mod adapter;
pub mod complexity;
pub mod context;
pub mod coordinator;
pub mod cost;
pub mod error;
pub mod executor;
pub mod gates;
pub mod routing;
pub mod scope;
pub mod workflow;

// Re-exports for convenience
pub use adapter::{
    Adapter, AdapterDescriptor, AdapterFactory, AdapterKind, AdapterRef, AdapterRegistry,
    AdapterResult, PerformanceProfile, PluginLoader, PluginSpec,
};
pub use complexity::{ComplexityAnalysis, ComplexityAnalyzer, ComplexityFactors, OperationType};
pub use context::{ExecutionContext, StepRecord};
pub use coordinator::{
    CostEstimate, StepEstimate, WorkflowCoordinator, WorkflowResult, WorkflowValidationReport,
};
pub use cost::{
    BudgetCheck, BudgetLimit, CoordinationBudget, CoordinationBudgetStatus, CoordinationSummary,
    CostCalculator, CostStorage, CostTracker, DailyUsage, JsonlCostStorage, MemoryCostStorage,
    SqliteCostStorage, TokenUsage, UsageScope, WorkflowCostSummary,
};
pub use error::{Error, Result};
pub use executor::{
    StepExecutionResult, StepExecutor, StepValidationIssue, StepValidationReport,
};
pub use gates::{GateEngine, GateKind, GateResult, GateSpec, GateSummary};
pub use routing::{
    AdapterMetrics, AllocationPlan, Assignment, ParallelPlan, PerformanceHistory, Router,
    RoutingDecision, MAX_PARALLEL_AI,
};
pub use scope::{FileClaim, FileScopeManager, ScopeConflict, ScopeMode};
pub use workflow::{
    CoordinationMeta, FilePatterns, Phase, PhaseTask, Policy, Step, Timeouts, Workflow,
    WorkflowMetadata, WorkflowSchema,
};
