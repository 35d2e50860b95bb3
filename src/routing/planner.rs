//! Parallel execution planning over routed steps.

use super::router::{Router, RoutingDecision};
use crate::adapter::AdapterKind;
use crate::scope::{FileClaim, ScopeConflict};
use crate::workflow::{Policy, Step};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Max AI steps scheduled into one concurrent group, protecting external
/// rate limits.
pub const MAX_PARALLEL_AI: usize = 3;

/// Plan for executing a set of steps with conflict-aware grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelPlan {
    /// One routing decision per step, in input order
    pub decisions: Vec<RoutingDecision>,
    /// Groups of step indices; groups run sequentially, members in parallel
    pub execution_groups: Vec<Vec<usize>>,
    pub conflicts: Vec<ScopeConflict>,
    /// Adapter name -> indices of steps assigned to it
    pub resource_allocation: HashMap<String, Vec<usize>>,
    pub total_estimated_tokens: u64,
}

impl Router {
    /// Route a list of steps and group them for parallel execution.
    ///
    /// Without scope conflicts, deterministic steps form one parallel group
    /// and AI steps are chunked into groups of at most [`MAX_PARALLEL_AI`].
    /// Any step involved in a conflict runs in its own singleton group.
    pub fn plan_parallel_steps(&self, steps: &[Step], policy: Option<&Policy>) -> ParallelPlan {
        let decisions: Vec<RoutingDecision> = steps
            .iter()
            .map(|step| self.route_step(step, policy))
            .collect();

        // Claims carry the owning step index so conflicts map back to steps.
        let mut claims = Vec::new();
        let mut claim_owners: HashMap<String, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            let patterns = step.claimed_patterns();
            if patterns.is_empty() {
                continue;
            }
            let owner = format!("step_{}_{}", i, step.id);
            claim_owners.insert(owner.clone(), i);
            claims.push(FileClaim::new(owner, patterns, step.scope_mode));
        }

        let conflicts = self.scope_manager().detect_conflicts(&claims);
        let execution_groups = build_groups(&decisions, &conflicts, &claim_owners, steps.len());

        let mut resource_allocation: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, decision) in decisions.iter().enumerate() {
            resource_allocation
                .entry(decision.adapter_name.clone())
                .or_default()
                .push(i);
        }

        let total_estimated_tokens = decisions.iter().map(|d| d.estimated_tokens).sum();

        ParallelPlan {
            decisions,
            execution_groups,
            conflicts,
            resource_allocation,
            total_estimated_tokens,
        }
    }

    /// Token estimate for a set of steps routed independently.
    pub fn estimate_parallel_cost(&self, steps: &[Step]) -> u64 {
        steps
            .iter()
            .map(|step| self.route_step(step, None).estimated_tokens)
            .sum()
    }
}

fn build_groups(
    decisions: &[RoutingDecision],
    conflicts: &[ScopeConflict],
    claim_owners: &HashMap<String, usize>,
    step_count: usize,
) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();

    if conflicts.is_empty() {
        let mut deterministic = Vec::new();
        let mut ai = Vec::new();
        for (i, decision) in decisions.iter().enumerate() {
            match decision.adapter_kind {
                AdapterKind::Deterministic => deterministic.push(i),
                AdapterKind::Ai => ai.push(i),
            }
        }
        if !deterministic.is_empty() {
            groups.push(deterministic);
        }
        for chunk in ai.chunks(MAX_PARALLEL_AI) {
            groups.push(chunk.to_vec());
        }
        return groups;
    }

    // Conflicting steps are serialized as singletons; the rest share one
    // parallel group.
    let conflicting: BTreeSet<usize> = conflicts
        .iter()
        .flat_map(|c| c.owners.iter())
        .filter_map(|owner| claim_owners.get(owner).copied())
        .collect();

    let free: Vec<usize> = (0..step_count).filter(|i| !conflicting.contains(i)).collect();
    if !free.is_empty() {
        groups.push(free);
    }
    for index in conflicting {
        groups.push(vec![index]);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedAdapter;
    use crate::adapter::AdapterRegistry;
    use crate::scope::ScopeMode;
    use crate::workflow::FilePatterns;
    use std::sync::Arc;

    fn router() -> Router {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedAdapter::deterministic("code_fixers")));
        registry.register(Arc::new(ScriptedAdapter::deterministic("pytest_runner")));
        registry.register(Arc::new(ScriptedAdapter::ai("ai_editor", 1500)));
        registry.register(Arc::new(ScriptedAdapter::ai("ai_analyst", 900)));
        Router::new(Arc::new(registry))
    }

    fn step(id: &str, actor: &str, files: Option<&str>, mode: ScopeMode) -> Step {
        Step {
            id: id.into(),
            name: format!("step {}", id),
            actor: actor.into(),
            files: files.map(|f| FilePatterns::One(f.into())),
            scope_mode: mode,
            ..Step::default()
        }
    }

    #[test]
    fn test_conflicting_exclusive_steps_become_singletons() {
        let router = router();
        let steps = vec![
            step("a", "code_fixers", Some("src/**/*.py"), ScopeMode::Exclusive),
            step("b", "code_fixers", Some("src/app/main.py"), ScopeMode::Exclusive),
        ];

        let plan = router.plan_parallel_steps(&steps, None);
        assert!(!plan.conflicts.is_empty());
        assert_eq!(plan.execution_groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_conflict_free_steps_group_by_kind() {
        let router = router();
        let policy = Policy {
            prefer_deterministic: false,
            ..Policy::default()
        };
        let steps = vec![
            step("d1", "code_fixers", Some("src/a.py"), ScopeMode::Exclusive),
            step("d2", "pytest_runner", Some("tests/b.py"), ScopeMode::Exclusive),
            step("a1", "ai_editor", None, ScopeMode::Exclusive),
            step("a2", "ai_editor", None, ScopeMode::Exclusive),
            step("a3", "ai_analyst", None, ScopeMode::Exclusive),
            step("a4", "ai_analyst", None, ScopeMode::Exclusive),
        ];

        let plan = router.plan_parallel_steps(&steps, Some(&policy));
        assert!(plan.conflicts.is_empty());
        // One deterministic group, then AI chunks capped at three.
        assert_eq!(plan.execution_groups[0], vec![0, 1]);
        assert_eq!(plan.execution_groups[1], vec![2, 3, 4]);
        assert_eq!(plan.execution_groups[2], vec![5]);
    }

    #[test]
    fn test_mixed_conflict_grouping_keeps_free_steps_parallel() {
        let router = router();
        let steps = vec![
            step("a", "code_fixers", Some("src/lib.py"), ScopeMode::Exclusive),
            step("b", "code_fixers", Some("src/lib.py"), ScopeMode::Exclusive),
            step("c", "pytest_runner", Some("tests/test_x.py"), ScopeMode::Exclusive),
        ];

        let plan = router.plan_parallel_steps(&steps, None);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.execution_groups, vec![vec![2], vec![0], vec![1]]);
    }

    #[test]
    fn test_resource_allocation_and_totals() {
        let router = router();
        let policy = Policy {
            prefer_deterministic: false,
            ..Policy::default()
        };
        let steps = vec![
            step("a", "code_fixers", None, ScopeMode::Exclusive),
            step("b", "ai_editor", None, ScopeMode::Exclusive),
            step("c", "ai_editor", None, ScopeMode::Exclusive),
        ];

        let plan = router.plan_parallel_steps(&steps, Some(&policy));
        assert_eq!(plan.resource_allocation["code_fixers"], vec![0]);
        assert_eq!(plan.resource_allocation["ai_editor"], vec![1, 2]);
        let ai_tokens: u64 = plan.decisions[1].estimated_tokens + plan.decisions[2].estimated_tokens;
        assert_eq!(plan.total_estimated_tokens, ai_tokens);
        assert!(plan.total_estimated_tokens > 0);
    }
}
