//! Validation Engine: runs a stage's checks concurrently and reduces them
//!
//! Every check gets its own timeout; the whole pass is additionally bounded
//! by a stage deadline. A check that errors, panics or runs out of time is
//! recorded as a critical `fail`: an unknown state is never treated as safe.

use super::checks::{
    ArtifactShapeCheck, CheckContext, EnvironmentProbe, EnvironmentReadinessCheck,
    ExpectedResultsRealismCheck, FeatureAvailabilityCheck, TestLogicCheck, ValidationCheck,
    ARTIFACT_SHAPE, DEFAULT_ENVIRONMENT_SIGNATURES, DEFAULT_FEATURE_SIGNATURES,
    ENVIRONMENT_READINESS, EXPECTED_RESULTS_REALISM, FEATURE_AVAILABILITY, TEST_LOGIC,
};
use super::report::{reduce, ReductionPolicy, ValidationResult, ValidationVerdict};
use crate::config::ConfigError;
use crate::pipeline::Stage;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub check_timeout_secs: u64,
    /// Bound on the whole pass, independent of individual check timeouts
    pub stage_timeout_secs: u64,
    pub reduction: ReductionPolicy,
    /// Regexes counted by the feature-availability check
    pub feature_signatures: Vec<String>,
    /// Signature count at which feature-availability reports `soft_fail`
    pub feature_threshold: usize,
    pub environment_signatures: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 30,
            stage_timeout_secs: 120,
            reduction: ReductionPolicy::default(),
            feature_signatures: DEFAULT_FEATURE_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            feature_threshold: 2,
            environment_signatures: DEFAULT_ENVIRONMENT_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Default ordered check list for a stage
pub fn default_checks_for(stage: Stage) -> Vec<&'static str> {
    match stage {
        Stage::Setup | Stage::RepoAccess | Stage::Implementation => {
            vec![ARTIFACT_SHAPE, ENVIRONMENT_READINESS]
        }
        Stage::Analysis => vec![ARTIFACT_SHAPE, FEATURE_AVAILABILITY],
        Stage::PlanGeneration | Stage::QualityValidation => vec![
            ARTIFACT_SHAPE,
            ENVIRONMENT_READINESS,
            FEATURE_AVAILABILITY,
            TEST_LOGIC,
            EXPECTED_RESULTS_REALISM,
        ],
        Stage::HumanReview => vec![],
    }
}

pub struct ValidationEngine {
    checks: HashMap<String, Arc<dyn ValidationCheck>>,
    stage_checks: HashMap<Stage, Vec<String>>,
    check_timeout: Duration,
    stage_timeout: Duration,
    reduction: ReductionPolicy,
}

impl ValidationEngine {
    /// Engine with the built-in checks and default stage lists.
    pub fn new(config: &ValidationConfig) -> Result<Self, ConfigError> {
        Self::build(config, None)
    }

    /// Like [`ValidationEngine::new`], with environment-readiness awaiting `probe`.
    pub fn with_probe(
        config: &ValidationConfig,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, Some(probe))
    }

    fn build(
        config: &ValidationConfig,
        probe: Option<Arc<dyn EnvironmentProbe>>,
    ) -> Result<Self, ConfigError> {
        let mut engine = Self {
            checks: HashMap::new(),
            stage_checks: Stage::ALL
                .iter()
                .map(|s| {
                    (
                        *s,
                        default_checks_for(*s).into_iter().map(String::from).collect(),
                    )
                })
                .collect(),
            check_timeout: Duration::from_secs(config.check_timeout_secs),
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            reduction: config.reduction.clone(),
        };
        engine.register(Arc::new(ArtifactShapeCheck));
        engine.register(Arc::new(EnvironmentReadinessCheck::new(
            &config.environment_signatures,
            probe,
        )?));
        engine.register(Arc::new(FeatureAvailabilityCheck::new(
            &config.feature_signatures,
            config.feature_threshold,
        )?));
        engine.register(Arc::new(TestLogicCheck));
        engine.register(Arc::new(ExpectedResultsRealismCheck));
        Ok(engine)
    }

    /// Add a check, replacing any check with the same name.
    pub fn register(&mut self, check: Arc<dyn ValidationCheck>) {
        self.checks.insert(check.name().to_string(), check);
    }

    /// Replace the ordered check list of a stage.
    pub fn set_stage_checks(&mut self, stage: Stage, names: Vec<String>) {
        self.stage_checks.insert(stage, names);
    }

    pub fn checks_for(&self, stage: Stage) -> &[String] {
        self.stage_checks
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn reduction(&self) -> &ReductionPolicy {
        &self.reduction
    }

    pub fn set_timeouts(&mut self, check_timeout: Duration, stage_timeout: Duration) {
        self.check_timeout = check_timeout;
        self.stage_timeout = stage_timeout;
    }

    /// Validate `artifact` for `ctx.stage`. Results keep the configured order.
    pub async fn validate(&self, artifact: &str, ctx: &CheckContext) -> ValidationVerdict {
        let deadline = Instant::now() + self.stage_timeout;
        let names = self.checks_for(ctx.stage);
        let results = join_all(
            names
                .iter()
                .map(|name| self.run_check(name, artifact, ctx, deadline)),
        )
        .await;

        let verdict = reduce(results, &self.reduction);
        debug!(
            stage = %ctx.stage,
            verdict = %verdict.overall,
            checks = verdict.results.len(),
            "Validation pass complete"
        );
        verdict
    }

    async fn run_check(
        &self,
        name: &str,
        artifact: &str,
        ctx: &CheckContext,
        stage_deadline: Instant,
    ) -> ValidationResult {
        let Some(check) = self.checks.get(name) else {
            warn!(check = name, stage = %ctx.stage, "Check is not registered");
            return ValidationResult::fail(name, "check is not registered").critical(true);
        };

        let check_deadline = (Instant::now() + self.check_timeout).min(stage_deadline);
        let hit_stage_deadline = check_deadline == stage_deadline;
        let guarded = AssertUnwindSafe(check.run(artifact, ctx)).catch_unwind();

        match tokio::time::timeout_at(check_deadline, guarded).await {
            Ok(Ok(Ok(mut result))) => {
                result.check_name = name.to_string();
                result.critical = check.critical();
                result
            }
            Ok(Ok(Err(e))) => {
                warn!(check = name, stage = %ctx.stage, error = %e, "Check could not run");
                ValidationResult::fail(name, format!("check could not run: {e}")).critical(true)
            }
            Ok(Err(_)) => {
                warn!(check = name, stage = %ctx.stage, "Check panicked");
                ValidationResult::fail(name, "check panicked").critical(true)
            }
            Err(_) => {
                let message = if hit_stage_deadline {
                    format!(
                        "stage deadline of {}s reached before check finished",
                        self.stage_timeout.as_secs()
                    )
                } else {
                    format!("check timed out after {}s", self.check_timeout.as_secs())
                };
                warn!(check = name, stage = %ctx.stage, "{message}");
                ValidationResult::fail(name, message).critical(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{CheckError, CheckStatus, Verdict};
    use async_trait::async_trait;

    const PLAN: &str = "| Step | Expected Result |\n|---|---|\n\
        | kubectl apply -f gw.yaml | gateway/demo created |\n\
        | kubectl get gateway demo | STATUS shows Programmed=True |\n";

    struct SlowCheck(Duration);

    #[async_trait]
    impl ValidationCheck for SlowCheck {
        fn name(&self) -> &str {
            "slow"
        }
        fn critical(&self) -> bool {
            false
        }
        async fn run(&self, _: &str, _: &CheckContext) -> Result<ValidationResult, CheckError> {
            tokio::time::sleep(self.0).await;
            Ok(ValidationResult::pass("slow", "done"))
        }
    }

    struct PanickyCheck;

    #[async_trait]
    impl ValidationCheck for PanickyCheck {
        fn name(&self) -> &str {
            "panicky"
        }
        fn critical(&self) -> bool {
            false
        }
        async fn run(&self, _: &str, _: &CheckContext) -> Result<ValidationResult, CheckError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_good_plan_passes_in_order() {
        let engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        let verdict = engine
            .validate(PLAN, &CheckContext::new(Stage::PlanGeneration))
            .await;
        assert_eq!(verdict.overall, Verdict::Pass, "{}", verdict.format_for_operator());
        let names: Vec<_> = verdict.results.iter().map(|r| r.check_name.as_str()).collect();
        assert_eq!(names, default_checks_for(Stage::PlanGeneration));
    }

    #[tokio::test]
    async fn test_human_review_has_no_checks() {
        let engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        let verdict = engine.validate("", &CheckContext::new(Stage::HumanReview)).await;
        assert!(verdict.is_pass());
        assert!(verdict.results.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_plus_missing_feature_is_hard_fail() {
        let engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        let artifact = format!(
            "Environment check: cluster unreachable\n\
             Error: routes.route.openshift.io not found\n\
             Error: CRD missing\n\n{PLAN}"
        );
        let verdict = engine
            .validate(&artifact, &CheckContext::new(Stage::PlanGeneration))
            .await;
        assert_eq!(verdict.overall, Verdict::HardFail);
        assert!(verdict
            .results
            .iter()
            .any(|r| r.check_name == FEATURE_AVAILABILITY && r.status == CheckStatus::SoftFail));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_critical_fail() {
        let mut engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        engine.register(Arc::new(SlowCheck(Duration::from_secs(60))));
        engine.set_stage_checks(Stage::Analysis, vec![ARTIFACT_SHAPE.into(), "slow".into()]);
        engine.set_timeouts(Duration::from_secs(1), Duration::from_secs(10));

        let verdict = engine.validate(PLAN, &CheckContext::new(Stage::Analysis)).await;
        assert_eq!(verdict.overall, Verdict::HardFail);
        let slow = &verdict.results[1];
        assert!(slow.critical);
        assert!(slow.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_deadline_bounds_pass() {
        let mut engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        engine.register(Arc::new(SlowCheck(Duration::from_secs(60))));
        engine.set_stage_checks(Stage::Analysis, vec!["slow".into()]);
        engine.set_timeouts(Duration::from_secs(30), Duration::from_secs(5));

        let verdict = engine.validate(PLAN, &CheckContext::new(Stage::Analysis)).await;
        assert!(verdict.results[0].message.contains("stage deadline"));
    }

    #[tokio::test]
    async fn test_panic_and_unknown_checks_fail_critically() {
        let mut engine = ValidationEngine::new(&ValidationConfig::default()).unwrap();
        engine.register(Arc::new(PanickyCheck));
        engine.set_stage_checks(Stage::Analysis, vec!["panicky".into(), "missing".into()]);
        let verdict = engine.validate(PLAN, &CheckContext::new(Stage::Analysis)).await;
        assert_eq!(verdict.overall, Verdict::HardFail);
        assert!(verdict.results.iter().all(|r| r.is_critical_failure()));
    }
}
