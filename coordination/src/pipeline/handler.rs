//! Stage handlers: what executing one stage means
//!
//! The controller decides *whether* a stage runs; a [`StageHandler`] decides
//! *how*. [`OracleStageHandler`] is the production handler:
//!
//! ```text
//! assemble context → oracle (via gateway) → normalize → validate
//! ```

use super::types::{Stage, WorkflowState};
use crate::config::{ConfigError, PipelineConfig};
use crate::context::{ContextAssembler, StageInputs, Taxonomy};
use crate::normalizer::ArtifactNormalizer;
use crate::oracle::{GatewayError, OracleGateway, SharedOracle};
use crate::sources::RepoExcerpt;
use crate::validation::{
    CheckContext, EnvironmentProbe, ValidationEngine, ValidationResult, ValidationVerdict,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name reported for oracle transport failures
pub const ORACLE_CHECK: &str = "oracle";

/// Everything a handler gets for one invocation. Borrowed from the
/// controller's snapshot; handlers never mutate run state.
pub struct StageRequest<'a> {
    pub state: &'a WorkflowState,
    pub ticket_text: &'a str,
    pub excerpts: &'a [RepoExcerpt],
    /// Normalized artifacts of earlier stages, in pipeline order
    pub prior_artifacts: &'a [(Stage, String)],
    pub cancel: &'a CancellationToken,
}

impl StageRequest<'_> {
    pub fn stage(&self) -> Stage {
        self.state.current_stage
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageExecution {
    /// The oracle answered; `verdict` says whether the answer is usable
    Completed {
        raw: String,
        normalized: String,
        verdict: ValidationVerdict,
    },
    /// No artifact could be produced
    Failed { verdict: ValidationVerdict },
    Cancelled,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(&self, request: StageRequest<'_>) -> StageExecution;
}

pub type SharedStageHandler = Arc<dyn StageHandler>;

pub struct OracleStageHandler {
    assembler: ContextAssembler,
    gateway: OracleGateway,
    normalizer: ArtifactNormalizer,
    engine: ValidationEngine,
}

impl OracleStageHandler {
    pub fn new(
        assembler: ContextAssembler,
        gateway: OracleGateway,
        normalizer: ArtifactNormalizer,
        engine: ValidationEngine,
    ) -> Self {
        Self {
            assembler,
            gateway,
            normalizer,
            engine,
        }
    }

    /// Handler wired from configuration, with an optional environment probe
    pub fn from_config(
        config: &PipelineConfig,
        oracle: SharedOracle,
        taxonomy: Taxonomy,
        probe: Option<Arc<dyn EnvironmentProbe>>,
    ) -> Result<Self, ConfigError> {
        let engine = match probe {
            Some(probe) => ValidationEngine::with_probe(&config.validation, probe)?,
            None => ValidationEngine::new(&config.validation)?,
        };
        Ok(Self::new(
            ContextAssembler::new(config.assembler.clone(), taxonomy),
            OracleGateway::new(
                oracle,
                config.oracle_retry.clone(),
                Duration::from_secs(config.oracle_call_timeout_secs),
            ),
            ArtifactNormalizer::new(&config.normalizer)?,
            engine,
        ))
    }

    pub fn engine(&self) -> &ValidationEngine {
        &self.engine
    }
}

#[async_trait]
impl StageHandler for OracleStageHandler {
    async fn execute(&self, request: StageRequest<'_>) -> StageExecution {
        let stage = request.stage();
        let state = request.state;
        let context = self.assembler.assemble(&StageInputs {
            stage,
            ticket_id: &state.ticket_id,
            ticket_text: request.ticket_text,
            excerpts: request.excerpts,
            prior_artifacts: request.prior_artifacts,
            delta: &state.context_delta,
        });
        debug!(
            run_id = %state.short_id(),
            stage = %stage,
            prompt_chars = context.prompt.len(),
            keywords = context.keywords.len(),
            excerpts = context.excerpts_used,
            refinements = state.context_delta.len(),
            "Context assembled"
        );

        let raw = match self.gateway.generate(&context.prompt, request.cancel).await {
            Ok(raw) => raw,
            Err(GatewayError::Cancelled) => {
                info!(run_id = %state.short_id(), stage = %stage, "Oracle call cancelled");
                return StageExecution::Cancelled;
            }
            Err(err) => {
                warn!(run_id = %state.short_id(), stage = %stage, error = %err, "Oracle failed");
                return StageExecution::Failed {
                    verdict: ValidationVerdict::hard_fail(ValidationResult::fail(
                        ORACLE_CHECK,
                        err.to_string(),
                    )),
                };
            }
        };

        let normalized = self.normalizer.normalize(&raw);
        let verdict = self
            .engine
            .validate(&normalized, &CheckContext::for_run(stage, &state.run_id))
            .await;
        if request.cancel.is_cancelled() {
            return StageExecution::Cancelled;
        }

        StageExecution::Completed {
            raw,
            normalized,
            verdict,
        }
    }
}
