//! Error types for stepflow-core.

use thiserror::Error;

/// Result type alias using stepflow-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during orchestration.
///
/// These surface only at internal boundaries. The execution entry points
/// (`WorkflowCoordinator::run*`, `StepExecutor::execute_step`) convert every
/// failure into a result value with `success == false` instead of returning
/// `Err`.
#[derive(Error, Debug)]
pub enum Error {
    /// Workflow document could not be loaded
    #[error("Workflow load error: {0}")]
    WorkflowLoad(String),

    /// Workflow document failed schema or structural validation
    #[error("Workflow validation error: {0}")]
    WorkflowInvalid(String),

    /// No adapter registered under the requested key
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Adapter constructor or plugin loader failed
    #[error("Adapter construction failed: {name} - {message}")]
    AdapterConstruction { name: String, message: String },

    /// Adapter exists but reports itself unavailable
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Cost or history storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Budget exhausted
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a workflow load error.
    pub fn workflow_load(message: impl Into<String>) -> Self {
        Self::WorkflowLoad(message.into())
    }

    /// Create a workflow validation error.
    pub fn workflow_invalid(message: impl Into<String>) -> Self {
        Self::WorkflowInvalid(message.into())
    }

    /// Create an adapter construction error.
    pub fn adapter_construction(
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::AdapterConstruction {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }
}
