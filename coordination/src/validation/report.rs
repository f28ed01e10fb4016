//! Validation Report: per-check results and the tri-state verdict
//!
//! Results are produced once per check per pass and never mutated. The
//! [`reduce`] function is the only place where results become a verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Recoverable: the adaptive loop should change generation strategy
    SoftFail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::SoftFail => write!(f, "SOFT"),
        }
    }
}

/// Result of one check against one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Check name (artifact-shape, feature-availability, ...)
    pub check_name: String,
    pub status: CheckStatus,
    /// Whether a `fail` here halts the run
    pub critical: bool,
    pub message: String,
    /// Free-form structured evidence (matches, scores, offending rows)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub evidence: serde_json::Value,
}

impl ValidationResult {
    pub fn pass(check_name: &str, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.to_string(),
            status: CheckStatus::Pass,
            critical: false,
            message: message.into(),
            evidence: serde_json::Value::Null,
        }
    }

    pub fn fail(check_name: &str, message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            ..Self::pass(check_name, message)
        }
    }

    pub fn soft_fail(check_name: &str, message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::SoftFail,
            ..Self::pass(check_name, message)
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }

    /// Whether this result should be fed to the adaptive loop
    pub fn is_failure(&self) -> bool {
        matches!(self.status, CheckStatus::Fail | CheckStatus::SoftFail)
    }

    pub fn is_critical_failure(&self) -> bool {
        self.critical && self.status == CheckStatus::Fail
    }
}

/// Tri-state reduction of a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    HardFail,
    SoftFailAdapt,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::HardFail => write!(f, "hard_fail"),
            Self::SoftFailAdapt => write!(f, "soft_fail_adapt"),
        }
    }
}

/// How results are reduced to a verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionPolicy {
    /// Number of `soft_fail` results that switches the verdict to soft_fail_adapt
    pub soft_fail_threshold: usize,
}

impl Default for ReductionPolicy {
    fn default() -> Self {
        Self {
            soft_fail_threshold: 1,
        }
    }
}

/// Verdict plus the ordered results that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub overall: Verdict,
    pub results: Vec<ValidationResult>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn is_pass(&self) -> bool {
        self.overall == Verdict::Pass
    }

    /// Verdict for a stage that could not produce an artifact at all
    pub fn hard_fail(result: ValidationResult) -> Self {
        Self {
            overall: Verdict::HardFail,
            results: vec![result.critical(true)],
            timestamp: Utc::now(),
        }
    }

    /// Results that feed the adaptive loop, in check order
    pub fn failures(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    /// Operator-facing multi-line summary
    pub fn format_for_operator(&self) -> String {
        let mut out = format!("verdict: {}\n", self.overall);
        for result in &self.results {
            out.push_str(&format!(
                "  [{}]{} {}: {}\n",
                result.status,
                if result.critical { "!" } else { " " },
                result.check_name,
                result.message
            ));
        }
        out
    }
}

/// Reduce check results to a verdict.
///
/// A critical `fail` wins over everything. Otherwise enough `soft_fail`
/// results select the adaptive loop. Non-critical `fail`s are recorded but
/// never block.
pub fn reduce(results: Vec<ValidationResult>, policy: &ReductionPolicy) -> ValidationVerdict {
    let overall = if results.iter().any(ValidationResult::is_critical_failure) {
        Verdict::HardFail
    } else if policy.soft_fail_threshold > 0
        && results
            .iter()
            .filter(|r| r.status == CheckStatus::SoftFail)
            .count()
            >= policy.soft_fail_threshold
    {
        Verdict::SoftFailAdapt
    } else {
        Verdict::Pass
    };

    ValidationVerdict {
        overall,
        results,
        timestamp: Utc::now(),
    }
}
