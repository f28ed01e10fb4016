//! Built-in validation checks
//!
//! Each check is independent of the others in the same pass and only sees
//! the normalized artifact plus a small context. The engine decides
//! ordering, concurrency and timeouts.

use super::report::ValidationResult;
use crate::config::ConfigError;
use crate::normalizer::{prose_lines, step_tables};
use crate::pipeline::Stage;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

pub const ARTIFACT_SHAPE: &str = "artifact-shape";
pub const ENVIRONMENT_READINESS: &str = "environment-readiness";
pub const FEATURE_AVAILABILITY: &str = "feature-availability";
pub const TEST_LOGIC: &str = "test-logic";
pub const EXPECTED_RESULTS_REALISM: &str = "expected-results-realism";

/// Failure signatures that suggest the target feature is not shipped yet.
/// A named `subject` group, when present, is reported as evidence.
pub const DEFAULT_FEATURE_SIGNATURES: &[&str] = &[
    r"(?i)(?P<subject>[\w./-]+)\s*:?\s+not found",
    r"(?i)\bcrds?\s+(?:(?P<subject>[\w./-]+)\s+)?(?:is\s+|are\s+)?missing\b",
    r#"(?i)no matches for kind\s+"?(?P<subject>[\w./-]+)"?"#,
    r#"(?i)the server doesn't have a resource type\s+"?(?P<subject>[\w./-]+)"?"#,
    r#"(?i)unknown (?:field|flag|command)\s+"?(?P<subject>[\w./-]+)"?"#,
    r"(?i)\bnot (?:yet )?implemented\b",
];

/// Signatures of an unreachable test environment
pub const DEFAULT_ENVIRONMENT_SIGNATURES: &[&str] = &[
    r"(?i)connection refused",
    r"(?i)unable to connect to the server",
    r"(?i)no route to host",
    r"(?i)\b(?:environment|cluster|server)\s+(?:is\s+)?(?:unreachable|not reachable)\b",
    r"(?i)i/o timeout",
    r"(?i)name or service not known",
    r"(?i)could not resolve host",
];

static VAGUE_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:it\s+)?(?:works|worked|ok|okay|as expected|success|successful|passes|pass|n/?a|tbd|todo|should work|fine|-+)\.?$",
    )
    .expect("vague result regex is valid")
});

static SUB_SECOND_TIMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:in|within|under|less than)\s+\d+(?:\.\d+)?\s*(?:ms|msec|milliseconds?|us|microseconds?|ns|nanoseconds?)\b",
    )
    .expect("timing regex is valid")
});

/// Per-pass information a check may use
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub stage: Stage,
    pub run_id: Option<String>,
}

impl CheckContext {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            run_id: None,
        }
    }

    pub fn for_run(stage: Stage, run_id: impl Into<String>) -> Self {
        Self {
            stage,
            run_id: Some(run_id.into()),
        }
    }
}

/// A check that could not produce a result
#[derive(Error, Debug, Clone)]
pub enum CheckError {
    #[error("environment probe failed: {0}")]
    Probe(String),

    #[error("{0}")]
    Internal(String),
}

#[async_trait]
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a `fail` from this check halts the run
    fn critical(&self) -> bool;

    async fn run(&self, artifact: &str, ctx: &CheckContext)
        -> Result<ValidationResult, CheckError>;
}

/// Reachability probe for the environment a plan will run against
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Human-readable target (URL, cluster name)
    fn target(&self) -> &str;

    async fn probe(&self) -> Result<(), String>;
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

// ============================================================================
// artifact-shape
// ============================================================================

pub struct ArtifactShapeCheck;

#[async_trait]
impl ValidationCheck for ArtifactShapeCheck {
    fn name(&self) -> &str {
        ARTIFACT_SHAPE
    }

    fn critical(&self) -> bool {
        true
    }

    async fn run(
        &self,
        artifact: &str,
        _ctx: &CheckContext,
    ) -> Result<ValidationResult, CheckError> {
        let lines = artifact.lines().filter(|l| !l.trim().is_empty()).count();
        let result = if lines == 0 {
            ValidationResult::fail(ARTIFACT_SHAPE, "artifact is empty")
        } else {
            ValidationResult::pass(ARTIFACT_SHAPE, format!("{lines} non-empty lines"))
        };
        Ok(result
            .critical(true)
            .with_evidence(json!({ "lines": lines, "bytes": artifact.len() })))
    }
}

// ============================================================================
// environment-readiness
// ============================================================================

pub struct EnvironmentReadinessCheck {
    signatures: Vec<Regex>,
    probe: Option<Arc<dyn EnvironmentProbe>>,
}

impl EnvironmentReadinessCheck {
    pub fn new(
        signatures: &[String],
        probe: Option<Arc<dyn EnvironmentProbe>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            signatures: compile_all(signatures)?,
            probe,
        })
    }
}

#[async_trait]
impl ValidationCheck for EnvironmentReadinessCheck {
    fn name(&self) -> &str {
        ENVIRONMENT_READINESS
    }

    fn critical(&self) -> bool {
        true
    }

    async fn run(
        &self,
        artifact: &str,
        _ctx: &CheckContext,
    ) -> Result<ValidationResult, CheckError> {
        if let Some(probe) = &self.probe {
            probe.probe().await.map_err(|e| {
                CheckError::Probe(format!("{} unreachable: {e}", probe.target()))
            })?;
        }

        // Expected results inside step tables may legitimately mention
        // refused connections (negative tests); only prose is a report.
        let hits: Vec<String> = prose_lines(artifact)
            .iter()
            .filter_map(|line| {
                self.signatures
                    .iter()
                    .find_map(|re| re.find(line).map(|m| m.as_str().to_string()))
            })
            .collect();

        let result = match hits.first() {
            Some(first) => ValidationResult::fail(
                ENVIRONMENT_READINESS,
                format!("environment unreachable: {first}"),
            )
            .with_evidence(json!({ "matches": hits })),
            None => ValidationResult::pass(ENVIRONMENT_READINESS, "no unreachable-environment signatures"),
        };
        Ok(result.critical(true))
    }
}

// ============================================================================
// feature-availability
// ============================================================================

/// Detects "the target feature is not implemented yet" from repeated
/// failure signatures and asks for adaptation instead of halting.
pub struct FeatureAvailabilityCheck {
    signatures: Vec<Regex>,
    threshold: usize,
}

impl FeatureAvailabilityCheck {
    pub fn new(signatures: &[String], threshold: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            signatures: compile_all(signatures)?,
            threshold: threshold.max(1),
        })
    }
}

#[async_trait]
impl ValidationCheck for FeatureAvailabilityCheck {
    fn name(&self) -> &str {
        FEATURE_AVAILABILITY
    }

    fn critical(&self) -> bool {
        false
    }

    async fn run(
        &self,
        artifact: &str,
        _ctx: &CheckContext,
    ) -> Result<ValidationResult, CheckError> {
        let mut matches = Vec::new();
        let mut subjects: Vec<String> = Vec::new();
        for re in &self.signatures {
            for caps in re.captures_iter(artifact) {
                if let Some(m) = caps.get(0) {
                    matches.push(m.as_str().trim().to_string());
                }
                if let Some(subject) = caps.name("subject") {
                    let subject = subject.as_str().to_string();
                    if !subjects.contains(&subject) {
                        subjects.push(subject);
                    }
                }
            }
        }
        let score = matches.len();
        let evidence = json!({
            "score": score,
            "threshold": self.threshold,
            "matches": matches,
            "subjects": subjects,
        });

        let result = if score >= self.threshold {
            let subject_list = if subjects.is_empty() {
                "unspecified".to_string()
            } else {
                subjects.join(", ")
            };
            ValidationResult::soft_fail(
                FEATURE_AVAILABILITY,
                format!("target feature appears unimplemented; missing: {subject_list}"),
            )
        } else {
            ValidationResult::pass(
                FEATURE_AVAILABILITY,
                format!("{score} failure signatures (threshold {})", self.threshold),
            )
        };
        Ok(result.with_evidence(evidence))
    }
}

// ============================================================================
// test-logic
// ============================================================================

pub struct TestLogicCheck;

#[async_trait]
impl ValidationCheck for TestLogicCheck {
    fn name(&self) -> &str {
        TEST_LOGIC
    }

    fn critical(&self) -> bool {
        false
    }

    async fn run(
        &self,
        artifact: &str,
        _ctx: &CheckContext,
    ) -> Result<ValidationResult, CheckError> {
        let tables = step_tables(artifact);
        if tables.is_empty() {
            return Ok(ValidationResult::fail(TEST_LOGIC, "no step/result table found"));
        }

        let rows: Vec<_> = tables.iter().flat_map(|t| t.rows.iter()).collect();
        if rows.is_empty() {
            return Ok(ValidationResult::fail(TEST_LOGIC, "step tables have no rows"));
        }

        let empty: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.step.is_empty() || r.expected.is_empty())
            .map(|(i, _)| i + 1)
            .collect();

        let mut seen = HashSet::new();
        let duplicates: Vec<String> = rows
            .iter()
            .filter(|r| !r.step.is_empty())
            .filter(|r| !seen.insert(r.step.to_lowercase()))
            .map(|r| r.step.clone())
            .collect();

        let evidence = json!({
            "tables": tables.len(),
            "rows": rows.len(),
            "empty_rows": empty,
            "duplicate_steps": duplicates,
        });

        let result = if !empty.is_empty() {
            ValidationResult::fail(TEST_LOGIC, "rows with an empty step or expected result")
        } else if !duplicates.is_empty() {
            ValidationResult::fail(TEST_LOGIC, "duplicated steps")
        } else {
            ValidationResult::pass(TEST_LOGIC, format!("{} steps", rows.len()))
        };
        Ok(result.with_evidence(evidence))
    }
}

// ============================================================================
// expected-results-realism
// ============================================================================

pub struct ExpectedResultsRealismCheck;

#[async_trait]
impl ValidationCheck for ExpectedResultsRealismCheck {
    fn name(&self) -> &str {
        EXPECTED_RESULTS_REALISM
    }

    fn critical(&self) -> bool {
        false
    }

    async fn run(
        &self,
        artifact: &str,
        _ctx: &CheckContext,
    ) -> Result<ValidationResult, CheckError> {
        let mut vague = Vec::new();
        let mut timing = Vec::new();
        for row in step_tables(artifact).iter().flat_map(|t| t.rows.iter()) {
            let expected = row.expected.trim();
            if expected.is_empty() {
                continue;
            }
            if VAGUE_RESULT.is_match(expected) {
                vague.push(expected.to_string());
            }
            if let Some(m) = SUB_SECOND_TIMING.find(expected) {
                timing.push(m.as_str().to_string());
            }
        }

        let evidence = json!({ "vague": vague, "sub_second_timing": timing });
        let result = if !vague.is_empty() {
            ValidationResult::fail(EXPECTED_RESULTS_REALISM, "vague expected results")
        } else if !timing.is_empty() {
            ValidationResult::fail(
                EXPECTED_RESULTS_REALISM,
                "expected results promise sub-second timing",
            )
        } else {
            ValidationResult::pass(EXPECTED_RESULTS_REALISM, "expected results are observable")
        };
        Ok(result.with_evidence(evidence))
    }
}
