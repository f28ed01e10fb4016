//! Validation: independent checks reduced to a tri-state verdict
//!
//! - `report`: results, verdicts and the pure [`reduce`] function
//! - `checks`: the [`ValidationCheck`] trait and built-in checks
//! - `engine`: concurrent execution with per-check and per-stage timeouts

pub mod checks;
pub mod engine;
pub mod report;

pub use checks::{
    CheckContext, CheckError, EnvironmentProbe, ValidationCheck, ARTIFACT_SHAPE,
    ENVIRONMENT_READINESS, EXPECTED_RESULTS_REALISM, FEATURE_AVAILABILITY, TEST_LOGIC,
};
pub use engine::{default_checks_for, ValidationConfig, ValidationEngine};
pub use report::{
    reduce, CheckStatus, ReductionPolicy, ValidationResult, ValidationVerdict, Verdict,
};
