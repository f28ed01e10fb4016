//! Adaptive Feedback Integrator
//!
//! Turns a failed validation pass into context refinements. Every failing
//! result is reduced to a signature and recorded in the knowledge base;
//! known signatures contribute their stored solution, unknown ones get a
//! synthesized solution at low confidence. The returned delta is the input
//! delta plus the new refinements: nothing is ever removed.

use super::signature::{normalize_message, Signature};
use crate::context::{ContextDelta, Refinement, RefinementSource};
use crate::knowledge::{KnowledgeResult, PatternDelta, SharedKnowledgeStore};
use crate::validation::{
    ValidationResult, ValidationVerdict, ARTIFACT_SHAPE, ENVIRONMENT_READINESS,
    EXPECTED_RESULTS_REALISM, FEATURE_AVAILABILITY, TEST_LOGIC,
};
use tracing::{debug, info};

pub struct AdaptiveFeedbackIntegrator {
    knowledge: SharedKnowledgeStore,
}

impl AdaptiveFeedbackIntegrator {
    pub fn new(knowledge: SharedKnowledgeStore) -> Self {
        Self { knowledge }
    }

    pub fn knowledge(&self) -> &SharedKnowledgeStore {
        &self.knowledge
    }

    /// Record every failure of `verdict` and return `context` extended with
    /// the matching refinements.
    pub fn refine(
        &self,
        verdict: &ValidationVerdict,
        context: &ContextDelta,
    ) -> KnowledgeResult<ContextDelta> {
        let mut delta = context.clone();
        for result in verdict.failures() {
            let signature = Signature::derive(&result.check_name, &result.message);
            let known = self.knowledge.get(&signature)?.is_some();
            let pattern = self.knowledge.upsert(
                &signature,
                &PatternDelta::new(
                    result.check_name.clone(),
                    normalize_message(&result.message),
                    synthesize_solution(result),
                ),
            )?;

            let source = if known {
                RefinementSource::Learned
            } else {
                RefinementSource::Synthesized
            };
            let added = delta.add(Refinement::new(
                signature.as_str(),
                pattern.solution_delta.clone(),
                source,
                pattern.confidence,
            ));
            debug!(
                signature = %signature.short(),
                check = %result.check_name,
                occurrences = pattern.occurrences,
                confidence = pattern.confidence,
                new_refinement = added,
                "Failure recorded"
            );
        }

        info!(
            verdict = %verdict.overall,
            before = context.len(),
            after = delta.len(),
            "Context refined"
        );
        Ok(delta)
    }
}

/// Name of the thing a failure is about, best effort
fn subject_of(result: &ValidationResult) -> String {
    let evidence = &result.evidence;
    ["subjects", "matches"]
        .iter()
        .find_map(|key| evidence.get(key)?.get(0)?.as_str().map(str::to_string))
        .unwrap_or_else(|| result.check_name.clone())
}

/// Generic solution for a failure seen for the first time
pub fn synthesize_solution(result: &ValidationResult) -> String {
    let subject = subject_of(result);
    match result.check_name.as_str() {
        FEATURE_AVAILABILITY => format!(
            "The target feature may not be implemented yet ({subject} is missing). Keep the plan \
             future-ready: add explicit prerequisite check for {subject} before any step that \
             depends on it, and expect the feature to become available later."
        ),
        ENVIRONMENT_READINESS => format!(
            "add explicit prerequisite check for environment reachability ({subject}) as the \
             first step"
        ),
        TEST_LOGIC => "Give every step one concrete action and a distinct, verifiable expected \
                       result in a two-column step/result table; never repeat a step."
            .to_string(),
        EXPECTED_RESULTS_REALISM => "Replace vague or sub-second expectations with observable \
                                     outcomes such as resource status, command output or HTTP \
                                     status codes."
            .to_string(),
        ARTIFACT_SHAPE => "Return a complete, non-empty answer for this stage.".to_string(),
        _ => format!("add explicit prerequisite check for {subject}"),
    }
}
