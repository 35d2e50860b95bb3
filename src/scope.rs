//! File-scope claims and conflict detection.
//!
//! Steps and workflows claim file patterns before parallel execution. The
//! scope manager predicts which claims would collide so the planner can
//! serialize them; it does not enforce anything at the filesystem level.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Claim mode over a file set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// Sole writer; conflicts with any overlapping claim
    #[default]
    Exclusive,
    /// Read-mostly; conflicts only with overlapping exclusive claims
    Shared,
}

/// A claim over a set of file patterns by one workflow or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileClaim {
    /// Owning workflow/step identifier
    pub owner: String,
    /// Glob patterns or literal paths claimed
    pub patterns: Vec<String>,
    pub mode: ScopeMode,
}

impl FileClaim {
    pub fn new(owner: impl Into<String>, patterns: Vec<String>, mode: ScopeMode) -> Self {
        Self {
            owner: owner.into(),
            patterns,
            mode,
        }
    }
}

/// A detected collision between two claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConflict {
    /// Owners of the colliding claims
    pub owners: Vec<String>,
    /// The pattern pairs that overlap, rendered as "a <-> b"
    pub overlapping_patterns: Vec<String>,
    pub reason: String,
}

/// Stateless conflict detector over file-pattern claims.
///
/// Operates on an immutable snapshot of claims; the only I/O is glob
/// expansion against the current working tree.
#[derive(Debug, Clone, Default)]
pub struct FileScopeManager;

impl FileScopeManager {
    pub fn new() -> Self {
        Self
    }

    /// Detect all pairwise conflicts in a claim set.
    ///
    /// Two claims conflict when at least one is exclusive and any of their
    /// patterns overlap. Two shared claims never conflict.
    pub fn detect_conflicts(&self, claims: &[FileClaim]) -> Vec<ScopeConflict> {
        let mut conflicts = Vec::new();
        for (i, a) in claims.iter().enumerate() {
            for b in claims.iter().skip(i + 1) {
                if a.mode == ScopeMode::Shared && b.mode == ScopeMode::Shared {
                    continue;
                }
                let overlaps = self.overlapping_pairs(a, b);
                if !overlaps.is_empty() {
                    conflicts.push(ScopeConflict {
                        owners: vec![a.owner.clone(), b.owner.clone()],
                        overlapping_patterns: overlaps,
                        reason: format!(
                            "{} ({:?}) and {} ({:?}) claim overlapping files",
                            a.owner, a.mode, b.owner, b.mode
                        ),
                    });
                }
            }
        }
        conflicts
    }

    fn overlapping_pairs(&self, a: &FileClaim, b: &FileClaim) -> Vec<String> {
        let mut pairs = Vec::new();
        for pa in &a.patterns {
            for pb in &b.patterns {
                if patterns_overlap(pa, pb) {
                    pairs.push(format!("{} <-> {}", pa, pb));
                }
            }
        }
        pairs
    }
}

/// Whether two patterns can address at least one common path.
///
/// Prefers concrete evidence: when both globs expand against the working tree
/// the expansions are intersected. When expansion yields nothing the patterns
/// are compared symbolically, which errs toward reporting an overlap.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }

    let paths_a = expand(a);
    let paths_b = expand(b);
    if !paths_a.is_empty() && !paths_b.is_empty() {
        return paths_a.intersection(&paths_b).next().is_some();
    }

    symbolic_overlap(a, b)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[')
}

fn expand(pattern: &str) -> HashSet<String> {
    if !is_glob(pattern) {
        return HashSet::new();
    }
    match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(_) => HashSet::new(),
    }
}

fn symbolic_overlap(a: &str, b: &str) -> bool {
    // Glob vs literal: the glob may match the literal path directly.
    match (is_glob(a), is_glob(b)) {
        (true, false) => Pattern::new(a).map(|p| p.matches(b)).unwrap_or(false),
        (false, true) => Pattern::new(b).map(|p| p.matches(a)).unwrap_or(false),
        (false, false) => false, // distinct literals
        (true, true) => {
            // Glob vs glob: compare the static prefixes before the first
            // wildcard; nested prefixes can address common paths.
            let pa = static_prefix(a);
            let pb = static_prefix(b);
            pa.starts_with(&pb) || pb.starts_with(&pa)
        }
    }
}

fn static_prefix(pattern: &str) -> String {
    pattern
        .chars()
        .take_while(|c| !matches!(c, '*' | '?' | '['))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn claim(owner: &str, patterns: &[&str], mode: ScopeMode) -> FileClaim {
        FileClaim::new(
            owner,
            patterns.iter().map(|s| s.to_string()).collect(),
            mode,
        )
    }

    #[test]
    fn test_exclusive_claims_on_nested_patterns_conflict() {
        let manager = FileScopeManager::new();
        let claims = vec![
            claim("step_0", &["src/**/*.py"], ScopeMode::Exclusive),
            claim("step_1", &["src/app/main.py"], ScopeMode::Exclusive),
        ];
        let conflicts = manager.detect_conflicts(&claims);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].owners, vec!["step_0", "step_1"]);
        assert_eq!(
            conflicts[0].overlapping_patterns,
            vec!["src/**/*.py <-> src/app/main.py"]
        );
    }

    #[test]
    fn test_shared_claims_never_conflict() {
        let manager = FileScopeManager::new();
        let claims = vec![
            claim("a", &["src/**"], ScopeMode::Shared),
            claim("b", &["src/**"], ScopeMode::Shared),
        ];
        assert!(manager.detect_conflicts(&claims).is_empty());
    }

    #[test]
    fn test_shared_vs_exclusive_conflicts() {
        let manager = FileScopeManager::new();
        let claims = vec![
            claim("reader", &["docs/**/*.md"], ScopeMode::Shared),
            claim("writer", &["docs/index.md"], ScopeMode::Exclusive),
        ];
        assert_eq!(manager.detect_conflicts(&claims).len(), 1);
    }

    #[test]
    fn test_disjoint_literals_do_not_conflict() {
        let manager = FileScopeManager::new();
        let claims = vec![
            claim("a", &["src/a.py"], ScopeMode::Exclusive),
            claim("b", &["src/b.py"], ScopeMode::Exclusive),
        ];
        assert!(manager.detect_conflicts(&claims).is_empty());
    }

    #[test]
    fn test_identical_patterns_conflict() {
        let manager = FileScopeManager::new();
        let claims = vec![
            claim("a", &["src/lib.rs"], ScopeMode::Exclusive),
            claim("b", &["src/lib.rs"], ScopeMode::Exclusive),
        ];
        assert_eq!(manager.detect_conflicts(&claims).len(), 1);
    }

    #[test]
    fn test_glob_vs_glob_prefix_overlap() {
        assert!(patterns_overlap("src/**/*.py", "src/app/**/*.py"));
        assert!(!patterns_overlap("src/**/*.py", "docs/**/*.md"));
    }

    #[test]
    fn test_concrete_expansion_wins_over_symbolic() {
        // Both globs resolve against a real tree; disjoint matches mean no
        // conflict even though the prefixes nest.
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg/a")).unwrap();
        std::fs::create_dir_all(root.join("pkg/b")).unwrap();
        std::fs::write(root.join("pkg/a/x.py"), "").unwrap();
        std::fs::write(root.join("pkg/b/y.py"), "").unwrap();

        let ga = format!("{}/pkg/a/*.py", root.display());
        let gb = format!("{}/pkg/b/*.py", root.display());
        assert!(!patterns_overlap(&ga, &gb));

        let all = format!("{}/pkg/**/*.py", root.display());
        assert!(patterns_overlap(&all, &ga));
    }

    proptest! {
        #[test]
        fn prop_shared_only_claim_sets_are_conflict_free(
            patterns in proptest::collection::vec("[a-z]{1,8}/[a-z]{1,8}", 1..6),
            n_claims in 1usize..5,
        ) {
            let manager = FileScopeManager::new();
            let claims: Vec<FileClaim> = (0..n_claims)
                .map(|i| FileClaim::new(format!("c{}", i), patterns.clone(), ScopeMode::Shared))
                .collect();
            prop_assert!(manager.detect_conflicts(&claims).is_empty());
        }

        #[test]
        fn prop_identical_exclusive_claims_conflict(
            pattern in "[a-z]{1,8}/[a-z]{1,8}\\.py",
        ) {
            let manager = FileScopeManager::new();
            let claims = vec![
                FileClaim::new("a", vec![pattern.clone()], ScopeMode::Exclusive),
                FileClaim::new("b", vec![pattern], ScopeMode::Exclusive),
            ];
            prop_assert_eq!(manager.detect_conflicts(&claims).len(), 1);
        }
    }
}
