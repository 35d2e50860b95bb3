//! Adapter performance history with best-effort persistence.
//!
//! Rolling execution metrics weight routing confidence and token estimates.
//! The history is advisory: losing or failing to persist it never affects
//! step outcomes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Learning rate for the exponential moving averages.
const EMA_ALPHA: f64 = 0.1;

/// Rolling metrics for one adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub average_time: f64,
    pub average_tokens: f64,
    pub success_rate: f64,
}

/// Per-adapter execution metrics, optionally file-backed.
#[derive(Debug, Default)]
pub struct PerformanceHistory {
    metrics: HashMap<String, AdapterMetrics>,
    path: Option<PathBuf>,
}

impl PerformanceHistory {
    /// In-memory history with no persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// History backed by a JSON file; a missing or unreadable file starts
    /// empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let metrics = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring malformed history file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            metrics,
            path: Some(path),
        }
    }

    /// Record one execution, updating averages and persisting best-effort.
    pub fn record(&mut self, adapter: &str, execution_time: f64, success: bool, tokens_used: u64) {
        let entry = self
            .metrics
            .entry(adapter.to_string())
            .or_insert_with(|| AdapterMetrics {
                success_rate: 1.0,
                ..AdapterMetrics::default()
            });

        entry.total_executions += 1;
        if success {
            entry.successful_executions += 1;
        }
        entry.average_time = (1.0 - EMA_ALPHA) * entry.average_time + EMA_ALPHA * execution_time;
        if tokens_used > 0 {
            entry.average_tokens =
                (1.0 - EMA_ALPHA) * entry.average_tokens + EMA_ALPHA * tokens_used as f64;
        }
        entry.success_rate = entry.successful_executions as f64 / entry.total_executions as f64;

        self.save();
    }

    /// Historical success rate, if the adapter has run before.
    pub fn success_rate(&self, adapter: &str) -> Option<f64> {
        self.metrics.get(adapter).map(|m| m.success_rate)
    }

    /// Historical token average, if non-zero.
    pub fn average_tokens(&self, adapter: &str) -> Option<f64> {
        self.metrics
            .get(adapter)
            .map(|m| m.average_tokens)
            .filter(|avg| *avg > 0.0)
    }

    pub fn metrics(&self, adapter: &str) -> Option<&AdapterMetrics> {
        self.metrics.get(adapter)
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let text = serde_json::to_string_pretty(&self.metrics)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::fs::write(path, text)
        })();
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist performance history");
        }
    }
}
