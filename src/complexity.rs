//! Step complexity analysis for routing decisions.
//!
//! Pure scoring over a step definition: file fan-out, estimated bytes,
//! inferred operation type, configuration weight, and context coupling are
//! combined into a score in [0, 1]. The only I/O is glob expansion and size
//! sampling against the working tree.

use crate::workflow::Step;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Operation category inferred from a step's actor and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Read,
    Format,
    Lint,
    Test,
    Edit,
    Refactor,
    Generate,
    Analyze,
    Unknown,
}

impl OperationType {
    /// Complexity contribution of this operation category.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Read | Self::Format => 0.1,
            Self::Lint => 0.15,
            Self::Test | Self::Unknown => 0.2,
            Self::Edit | Self::Analyze => 0.25,
            Self::Refactor | Self::Generate => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Format => "format",
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Edit => "edit",
            Self::Refactor => "refactor",
            Self::Generate => "generate",
            Self::Analyze => "analyze",
            Self::Unknown => "unknown",
        }
    }

    /// Whether deterministic tools typically handle this category well.
    pub fn is_mechanical(&self) -> bool {
        matches!(self, Self::Read | Self::Format | Self::Lint)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Individual factor contributions to the complexity score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub file_count: f64,
    pub file_size: f64,
    pub operation_type: f64,
    pub configuration: f64,
    pub context_deps: f64,
}

impl ComplexityFactors {
    pub fn total(&self) -> f64 {
        self.file_count + self.file_size + self.operation_type + self.configuration
            + self.context_deps
    }
}

/// Result of analyzing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    /// 0.0 (simple) to 1.0 (complex)
    pub score: f64,
    pub factors: ComplexityFactors,
    /// Files resolved from the step's patterns
    pub file_count: usize,
    /// Estimated total bytes across resolved files
    pub estimated_file_size: u64,
    pub operation_type: OperationType,
    /// Confidence that a deterministic tool can handle the step
    pub deterministic_confidence: f64,
}

static READ_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(read|get|fetch|load)\b").expect("invalid regex"));
static FORMAT_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(format|fix|clean)\b").expect("invalid regex"));
static LINT_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(lint|check|validate)\b").expect("invalid regex"));
static TEST_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(test|verify)\b").expect("invalid regex"));
static EDIT_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(edit|modify|change|update)\b").expect("invalid regex"));
static REFACTOR_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(refactor|restructure)\b").expect("invalid regex"));
static GENERATE_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(generate|create|build)\b").expect("invalid regex"));
static ANALYZE_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(analyze|review|assess)\b").expect("invalid regex"));

/// Infer the operation category from actor key and step name.
///
/// Specific tool hints win over name keywords, which win over the broad
/// AI-actor hint: an AI step named after a mechanical operation is still
/// classified by what it does.
pub fn infer_operation_type(step: &Step) -> OperationType {
    let actor = step.actor.as_str();

    if actor.contains("diagnostic") || actor.contains("lint") {
        return OperationType::Lint;
    }
    if actor.contains("test") || actor.contains("pytest") {
        return OperationType::Test;
    }
    if actor.contains("fix") || actor.contains("format") {
        return OperationType::Format;
    }
    if actor.contains("git") {
        return OperationType::Read;
    }

    let name = step.name.to_lowercase();
    if READ_WORDS.is_match(&name) {
        return OperationType::Read;
    }
    if FORMAT_WORDS.is_match(&name) {
        return OperationType::Format;
    }
    if LINT_WORDS.is_match(&name) {
        return OperationType::Lint;
    }
    if TEST_WORDS.is_match(&name) {
        return OperationType::Test;
    }
    if EDIT_WORDS.is_match(&name) {
        return OperationType::Edit;
    }
    if REFACTOR_WORDS.is_match(&name) {
        return OperationType::Refactor;
    }
    if GENERATE_WORDS.is_match(&name) {
        return OperationType::Generate;
    }
    if ANALYZE_WORDS.is_match(&name) {
        return OperationType::Analyze;
    }

    if actor.contains("edit") || actor.starts_with("ai_") {
        return OperationType::Edit;
    }
    OperationType::Unknown
}

/// Analyzes workflow step complexity to inform routing decisions.
#[derive(Debug, Clone, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze one step.
    pub fn analyze(&self, step: &Step) -> ComplexityAnalysis {
        let (file_count, estimated_size) = resolve_files(&step.claimed_patterns());

        let file_count_factor = match file_count {
            0 => 0.1,
            1..=3 => 0.2,
            4..=10 => 0.3,
            _ => 0.4,
        };

        let file_size_factor = if estimated_size < 10_000 {
            0.1
        } else if estimated_size < 100_000 {
            0.2
        } else {
            0.3
        };

        let operation_type = infer_operation_type(step);

        let configuration_factor = {
            let param_count = step.with_params.len();
            let nested = step
                .with_params
                .values()
                .any(|v| v.is_object() || v.is_array());
            if param_count == 0 {
                0.05
            } else if param_count <= 3 && !nested {
                0.1
            } else if param_count <= 6 || nested {
                0.15
            } else {
                0.2
            }
        };

        let context_factor = {
            let mut score = 0.0;
            if step.context.is_some() {
                score += 0.1;
            }
            if step.retry.is_some() {
                score += 0.05;
            }
            if step.when.is_some() {
                score += 0.05;
            }
            f64::min(score, 0.2)
        };

        let factors = ComplexityFactors {
            file_count: file_count_factor,
            file_size: file_size_factor,
            operation_type: operation_type.weight(),
            configuration: configuration_factor,
            context_deps: context_factor,
        };

        let score = f64::min(factors.total(), 1.0);

        let mut deterministic_confidence = f64::max(0.0, 1.0 - score);
        if operation_type.is_mechanical() {
            deterministic_confidence += 0.2;
        }
        if file_count <= 5 && estimated_size < 50_000 {
            deterministic_confidence += 0.1;
        }
        deterministic_confidence = f64::min(deterministic_confidence, 1.0);

        ComplexityAnalysis {
            score,
            factors,
            file_count,
            estimated_file_size: estimated_size,
            operation_type,
            deterministic_confidence,
        }
    }
}

/// Resolve claimed patterns to a file count and byte estimate.
///
/// Glob matches are size-sampled (first 5 files) and scaled up; unreadable
/// entries fall back to 1000 bytes, unusable patterns to 5 files / 5000
/// bytes so estimates stay conservative.
fn resolve_files(patterns: &[String]) -> (usize, u64) {
    let mut file_count = 0usize;
    let mut estimated_size = 0u64;

    for pattern in patterns {
        if pattern.contains('*') || pattern.contains('?') {
            match glob::glob(pattern) {
                Ok(paths) => {
                    let matched: Vec<_> = paths.filter_map(|p| p.ok()).collect();
                    file_count += matched.len();
                    let sample: Vec<_> = matched.iter().take(5).collect();
                    if !sample.is_empty() {
                        let scale = matched.len() as f64 / sample.len() as f64;
                        for path in sample {
                            let size = file_size(path).unwrap_or(1000);
                            estimated_size += (size as f64 * scale) as u64;
                        }
                    }
                }
                Err(_) => {
                    file_count += 5;
                    estimated_size += 5000;
                }
            }
        } else {
            file_count += 1;
            estimated_size += file_size(Path::new(pattern)).unwrap_or(1000);
        }
    }

    (file_count, estimated_size)
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FilePatterns;
    use proptest::prelude::*;
    use serde_json::json;

    fn step(actor: &str, name: &str) -> Step {
        Step {
            id: "s".into(),
            name: name.into(),
            actor: actor.into(),
            ..Step::default()
        }
    }

    #[test]
    fn test_operation_inference_actor_hints() {
        assert_eq!(
            infer_operation_type(&step("vscode_diagnostics", "x")),
            OperationType::Lint
        );
        assert_eq!(
            infer_operation_type(&step("pytest_runner", "x")),
            OperationType::Test
        );
        assert_eq!(
            infer_operation_type(&step("code_fixers", "x")),
            OperationType::Format
        );
        assert_eq!(
            infer_operation_type(&step("ai_editor", "x")),
            OperationType::Edit
        );
        assert_eq!(
            infer_operation_type(&step("git_ops", "x")),
            OperationType::Read
        );
    }

    #[test]
    fn test_operation_inference_name_hints() {
        assert_eq!(
            infer_operation_type(&step("custom", "Refactor the auth module")),
            OperationType::Refactor
        );
        assert_eq!(
            infer_operation_type(&step("custom", "Generate API docs")),
            OperationType::Generate
        );
        assert_eq!(
            infer_operation_type(&step("custom", "Review dependency graph")),
            OperationType::Analyze
        );
        assert_eq!(
            infer_operation_type(&step("custom", "mystery")),
            OperationType::Unknown
        );
    }

    #[test]
    fn test_no_files_scores_low() {
        let analyzer = ComplexityAnalyzer::new();
        let analysis = analyzer.analyze(&step("code_fixers", "Fix formatting"));
        assert_eq!(analysis.file_count, 0);
        assert_eq!(analysis.factors.file_count, 0.1);
        assert_eq!(analysis.factors.file_size, 0.1);
        assert!(analysis.score < 0.4);
        // Mechanical op on a tiny scope is highly deterministic.
        assert!(analysis.deterministic_confidence > 0.8);
    }

    #[test]
    fn test_real_files_are_counted_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("f{}.py", i)), vec![b'x'; 4000]).unwrap();
        }
        let mut s = step("ai_editor", "Edit the modules");
        s.files = Some(FilePatterns::One(format!("{}/*.py", dir.path().display())));

        let analysis = ComplexityAnalyzer::new().analyze(&s);
        assert_eq!(analysis.file_count, 4);
        assert_eq!(analysis.estimated_file_size, 16_000);
        assert_eq!(analysis.factors.file_count, 0.3);
        assert_eq!(analysis.factors.file_size, 0.2);
    }

    #[test]
    fn test_missing_literal_file_uses_fallback_size() {
        let mut s = step("code_fixers", "Fix one file");
        s.files = Some(FilePatterns::One("definitely/not/here.py".into()));
        let analysis = ComplexityAnalyzer::new().analyze(&s);
        assert_eq!(analysis.file_count, 1);
        assert_eq!(analysis.estimated_file_size, 1000);
    }

    #[test]
    fn test_configuration_and_context_factors() {
        let mut s = step("ai_editor", "Edit things");
        s.with_params.insert("prompt".into(), json!("do it"));
        s.with_params.insert("options".into(), json!({"a": 1}));
        s.retry = Some(json!({"max": 2}));
        s.when = Some("inputs.enabled".into());
        s.context = Some(json!({"needs": ["prior"]}));

        let analysis = ComplexityAnalyzer::new().analyze(&s);
        assert_eq!(analysis.factors.configuration, 0.15);
        assert_eq!(analysis.factors.context_deps, 0.2);
    }

    #[test]
    fn test_duplicating_files_never_lowers_file_factor() {
        let mut one = step("ai_editor", "Edit");
        one.files = Some(FilePatterns::Many(vec!["a.py".into(); 3]));
        let mut doubled = one.clone();
        doubled.files = Some(FilePatterns::Many(vec!["a.py".into(); 6]));

        let analyzer = ComplexityAnalyzer::new();
        let base = analyzer.analyze(&one);
        let more = analyzer.analyze(&doubled);
        assert!(more.factors.file_count >= base.factors.file_count);
        assert!(more.file_count > base.file_count);
    }

    proptest! {
        #[test]
        fn prop_score_and_confidence_stay_bounded(
            actor in "[a-z_]{0,12}",
            name in "[A-Za-z ]{0,24}",
            params in proptest::collection::vec("[a-z]{1,6}", 0..8),
            literals in proptest::collection::vec("[a-z]{1,8}\\.py", 0..12),
        ) {
            let mut s = step(&actor, &name);
            for p in params {
                s.with_params.insert(p, json!("v"));
            }
            if !literals.is_empty() {
                s.files = Some(FilePatterns::Many(literals));
            }
            let analysis = ComplexityAnalyzer::new().analyze(&s);
            prop_assert!((0.0..=1.0).contains(&analysis.score));
            prop_assert!((0.0..=1.0).contains(&analysis.deterministic_confidence));
        }
    }
}
