//! Per-step adapter selection.
//!
//! Routing is deterministic: the same step, policy, and registry state always
//! produce the same decision. Unknown or unavailable actors never fail the
//! route; they fall back with explicit reasoning.

use super::history::PerformanceHistory;
use crate::adapter::{AdapterKind, AdapterRegistry};
use crate::complexity::{ComplexityAnalysis, ComplexityAnalyzer, OperationType};
use crate::scope::FileScopeManager;
use crate::workflow::{Policy, Step};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Deterministic stand-ins for AI actors, tried when policy prefers
/// determinism. The table is data, not code.
const DETERMINISTIC_ALTERNATIVES: &[(&str, &str)] = &[
    ("ai_editor", "code_fixers"),
    ("ai_analyst", "vscode_diagnostics"),
];

/// AI upgrades for deterministic actors overwhelmed by complexity.
const AI_ALTERNATIVES: &[(&str, &str)] = &[
    ("code_fixers", "ai_editor"),
    ("vscode_diagnostics", "ai_analyst"),
    // Complex test generation outgrows the plain runner.
    ("pytest_runner", "ai_editor"),
];

/// Fallback order for simple steps whose actor is unknown.
const DETERMINISTIC_FALLBACKS: &[&str] = &["code_fixers", "vscode_diagnostics", "pytest_runner"];

/// Designated AI fallback adapter.
const AI_FALLBACK: &str = "ai_editor";

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Result of routing one workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub adapter_name: String,
    pub adapter_kind: AdapterKind,
    pub reasoning: String,
    pub estimated_tokens: u64,
    pub complexity_score: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_hint: Option<String>,
}

/// Routes workflow steps to adapters using complexity, policy, budget, and
/// execution history.
pub struct Router {
    registry: Arc<AdapterRegistry>,
    analyzer: ComplexityAnalyzer,
    scope_manager: FileScopeManager,
    history: Mutex<PerformanceHistory>,
}

impl Router {
    /// Router over a registry with no persisted history.
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            analyzer: ComplexityAnalyzer::new(),
            scope_manager: FileScopeManager::new(),
            history: Mutex::new(PerformanceHistory::in_memory()),
        }
    }

    /// Router with a file-backed performance history.
    pub fn with_history(registry: Arc<AdapterRegistry>, history: PerformanceHistory) -> Self {
        Self {
            registry,
            analyzer: ComplexityAnalyzer::new(),
            scope_manager: FileScopeManager::new(),
            history: Mutex::new(history),
        }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub(crate) fn scope_manager(&self) -> &FileScopeManager {
        &self.scope_manager
    }

    /// Analyze a step without routing it.
    pub fn analyze(&self, step: &Step) -> ComplexityAnalysis {
        self.analyzer.analyze(step)
    }

    /// Route one step. Never fails: unknown actors produce a fallback
    /// decision with explicit reasoning.
    pub fn route_step(&self, step: &Step, policy: Option<&Policy>) -> RoutingDecision {
        let actor = step.actor.as_str();
        let complexity = self.analyzer.analyze(step);

        if !self.registry.is_available(actor) {
            return self.fallback_by_complexity(&complexity);
        }

        let default_policy = Policy::default();
        let policy = policy.unwrap_or(&default_policy);
        let prefer_deterministic = policy.prefer_deterministic;
        let threshold = policy.complexity_threshold;

        // Safe: is_available constructed the adapter above.
        let adapter = match self.registry.get(actor) {
            Ok(adapter) => adapter,
            Err(_) => return self.fallback_by_complexity(&complexity),
        };

        match adapter.kind() {
            AdapterKind::Ai => {
                if prefer_deterministic {
                    if let Some(decision) =
                        self.try_downgrade(actor, &complexity, threshold)
                    {
                        return decision;
                    }
                }
                let tokens = self.estimate_ai_tokens(&complexity, actor);
                let confidence = self.ai_confidence(&complexity, actor);
                RoutingDecision {
                    adapter_name: actor.to_string(),
                    adapter_kind: AdapterKind::Ai,
                    reasoning: format!(
                        "AI tool: {} (complexity: {:.2})",
                        adapter.description(),
                        complexity.score
                    ),
                    estimated_tokens: tokens,
                    complexity_score: complexity.score,
                    confidence,
                    performance_hint: performance_hint(&complexity),
                }
            }
            AdapterKind::Deterministic => {
                let confidence = self.deterministic_confidence(&complexity, actor);
                if complexity.score > threshold && confidence < 0.5 {
                    if let Some(decision) =
                        self.try_upgrade(actor, &complexity, confidence)
                    {
                        return decision;
                    }
                }
                RoutingDecision {
                    adapter_name: actor.to_string(),
                    adapter_kind: AdapterKind::Deterministic,
                    reasoning: format!(
                        "Deterministic tool: {} (complexity: {:.2})",
                        adapter.description(),
                        complexity.score
                    ),
                    estimated_tokens: 0,
                    complexity_score: complexity.score,
                    confidence,
                    performance_hint: performance_hint(&complexity),
                }
            }
        }
    }

    /// Route honoring a role preference and a remaining token budget.
    ///
    /// The first preferred adapter whose estimate fits wins; over budget,
    /// the cheapest available deterministic adapter is used; with none
    /// registered, routing falls back to the default policy path.
    pub fn route_with_budget(
        &self,
        step: &Step,
        role: &str,
        budget_remaining: Option<u64>,
    ) -> RoutingDecision {
        let Some(remaining) = budget_remaining else {
            return self.route_step(step, None);
        };

        let preferred: &[&str] = if role.eq_ignore_ascii_case("ipt") {
            &["ai_analyst", "ai_editor"]
        } else {
            &["code_fixers", "pytest_runner", "vscode_diagnostics"]
        };

        for name in preferred {
            if !self.registry.is_available(name) {
                continue;
            }
            let estimate = self.registry.estimate_cost(name, step);
            if estimate <= remaining {
                let kind = self
                    .registry
                    .get(name)
                    .map(|a| a.kind())
                    .unwrap_or(AdapterKind::Deterministic);
                return RoutingDecision {
                    adapter_name: name.to_string(),
                    adapter_kind: kind,
                    reasoning: format!(
                        "Selected {} for role={} within budget",
                        name,
                        role.to_lowercase()
                    ),
                    estimated_tokens: estimate,
                    complexity_score: 0.0,
                    confidence: 1.0,
                    performance_hint: None,
                };
            }
        }

        // None fit: cheapest available deterministic adapter.
        let cheapest = self
            .registry
            .available_by_kind(AdapterKind::Deterministic)
            .into_iter()
            .map(|name| {
                let estimate = self.registry.estimate_cost(&name, step);
                (name, estimate)
            })
            .min_by_key(|(_, estimate)| *estimate);

        match cheapest {
            Some((name, estimate)) => RoutingDecision {
                adapter_name: name.clone(),
                adapter_kind: AdapterKind::Deterministic,
                reasoning: format!("Budget exceeded; using cheapest deterministic: {}", name),
                estimated_tokens: estimate,
                complexity_score: 0.0,
                confidence: 1.0,
                performance_hint: None,
            },
            None => self.route_step(step, None),
        }
    }

    /// Estimate tokens for a step without executing it.
    pub fn estimate_step_cost(&self, step: &Step) -> u64 {
        if step.actor.is_empty() {
            return 0;
        }
        self.registry.estimate_cost(&step.actor, step)
    }

    /// Feed one execution outcome back into the history.
    pub fn record_execution(
        &self,
        adapter_name: &str,
        execution_time: f64,
        success: bool,
        tokens_used: u64,
    ) {
        let mut history = self.history.lock().expect("history lock poisoned");
        history.record(adapter_name, execution_time, success, tokens_used);
    }

    fn try_downgrade(
        &self,
        actor: &str,
        complexity: &ComplexityAnalysis,
        threshold: f64,
    ) -> Option<RoutingDecision> {
        let alt = lookup(DETERMINISTIC_ALTERNATIVES, actor)?;
        if !self.registry.is_available(alt) {
            return None;
        }
        let confidence = self.deterministic_confidence(complexity, alt);
        if confidence > 0.6 && complexity.score <= threshold {
            debug!(from = actor, to = alt, score = complexity.score, "determinism-first downgrade");
            Some(RoutingDecision {
                adapter_name: alt.to_string(),
                adapter_kind: AdapterKind::Deterministic,
                reasoning: format!(
                    "Prefer deterministic: routed {} -> {} (score: {:.2})",
                    actor, alt, complexity.score
                ),
                estimated_tokens: 0,
                complexity_score: complexity.score,
                confidence,
                performance_hint: Some("prefer_deterministic".to_string()),
            })
        } else {
            None
        }
    }

    fn try_upgrade(
        &self,
        actor: &str,
        complexity: &ComplexityAnalysis,
        confidence: f64,
    ) -> Option<RoutingDecision> {
        let alt = lookup(AI_ALTERNATIVES, actor)?;
        if !self.registry.is_available(alt) {
            return None;
        }
        debug!(from = actor, to = alt, score = complexity.score, "complexity upgrade");
        Some(RoutingDecision {
            adapter_name: alt.to_string(),
            adapter_kind: AdapterKind::Ai,
            reasoning: format!(
                "Complex task (score: {:.2}) - upgraded from {} to {}",
                complexity.score, actor, alt
            ),
            estimated_tokens: self.estimate_ai_tokens(complexity, alt),
            complexity_score: complexity.score,
            confidence,
            performance_hint: Some("complex_upgrade".to_string()),
        })
    }

    fn fallback_by_complexity(&self, complexity: &ComplexityAnalysis) -> RoutingDecision {
        if complexity.score < 0.4 {
            for name in DETERMINISTIC_FALLBACKS {
                if self.registry.is_available(name) {
                    return RoutingDecision {
                        adapter_name: name.to_string(),
                        adapter_kind: AdapterKind::Deterministic,
                        reasoning: format!(
                            "Fallback to {} for simple task (complexity: {:.2})",
                            name, complexity.score
                        ),
                        estimated_tokens: 0,
                        complexity_score: complexity.score,
                        confidence: 0.6,
                        performance_hint: Some("fallback_simple".to_string()),
                    };
                }
            }
        }

        let tokens = (500.0 + complexity.score * 1500.0) as u64;
        RoutingDecision {
            adapter_name: AI_FALLBACK.to_string(),
            adapter_kind: AdapterKind::Ai,
            reasoning: format!(
                "AI fallback for complex task (complexity: {:.2})",
                complexity.score
            ),
            estimated_tokens: tokens,
            complexity_score: complexity.score,
            confidence: 0.7,
            performance_hint: Some("fallback_complex".to_string()),
        }
    }

    /// Confidence that a deterministic adapter handles the analyzed step.
    fn deterministic_confidence(&self, complexity: &ComplexityAnalysis, adapter: &str) -> f64 {
        let mut confidence = complexity.deterministic_confidence;

        confidence += match (adapter, complexity.operation_type) {
            ("code_fixers", OperationType::Format) => 0.2,
            ("code_fixers", OperationType::Lint) => 0.1,
            ("vscode_diagnostics", OperationType::Lint) => 0.2,
            ("vscode_diagnostics", OperationType::Analyze) => 0.1,
            ("pytest_runner", OperationType::Test) => 0.2,
            ("git_ops", OperationType::Read) => 0.2,
            _ => 0.0,
        };

        let history = self.history.lock().expect("history lock poisoned");
        if let Some(rate) = history.success_rate(adapter) {
            confidence *= rate;
        }
        f64::min(confidence, 1.0)
    }

    /// AI adapters grow more confident as complexity rises.
    fn ai_confidence(&self, complexity: &ComplexityAnalysis, adapter: &str) -> f64 {
        let mut confidence = 0.6 + complexity.score * 0.3;
        let history = self.history.lock().expect("history lock poisoned");
        if let Some(rate) = history.success_rate(adapter) {
            confidence *= rate;
        }
        f64::min(confidence, 1.0)
    }

    /// Complexity-driven token estimate, blended 50/50 with the adapter's
    /// rolling average when history exists.
    fn estimate_ai_tokens(&self, complexity: &ComplexityAnalysis, adapter: &str) -> u64 {
        let base = 1000.0;
        let mut tokens = base
            * (1.0 + complexity.score)
            * (1.0 + complexity.file_count as f64 * 0.1)
            * (1.0 + complexity.estimated_file_size as f64 / 100_000.0);

        let history = self.history.lock().expect("history lock poisoned");
        if let Some(avg) = history.average_tokens(adapter) {
            tokens = (tokens + avg) / 2.0;
        }
        tokens as u64
    }
}

fn performance_hint(complexity: &ComplexityAnalysis) -> Option<String> {
    let hint = if complexity.score > 0.8 {
        "high_complexity"
    } else if complexity.score < 0.2 {
        "low_complexity"
    } else if complexity.file_count > 20 {
        "many_files"
    } else if complexity.estimated_file_size > 500_000 {
        "large_files"
    } else if matches!(
        complexity.operation_type,
        OperationType::Refactor | OperationType::Generate
    ) {
        "complex_operation"
    } else {
        return None;
    };
    Some(hint.to_string())
}
