//! Plan Coordination Library
//!
//! Turns a ticket into a validated, human-approved test plan through a fixed
//! sequence of oracle-driven stages:
//!
//! ```text
//! Setup → RepoAccess → Analysis → PlanGeneration → HumanReview
//!       → Implementation → QualityValidation
//! ```
//!
//! Each stage assembles a context, asks the oracle, normalizes the answer and
//! runs it through independent validation checks. Soft failures feed the
//! adaptive loop (signature → knowledge base → refined context → retry);
//! hard failures halt the run with the full result list. Every transition is
//! persisted so a run survives restarts.
//!
//! # Components
//!
//! - [`pipeline`]: the controller state machine and stage handlers
//! - [`context`]: prompt assembly and additive context deltas
//! - [`oracle`]: oracle trait and the retrying, cancellable gateway
//! - [`normalizer`]: table chunking and flaky-construct stripping
//! - [`validation`]: checks, engine and tri-state verdicts
//! - [`feedback`]: failure signatures and the adaptive integrator
//! - [`knowledge`]: learned problem → solution patterns
//! - [`state`]: run and artifact persistence
//! - [`audit`]: append-only transition trail
//!
//! # Usage
//!
//! ```ignore
//! let controller = PipelineController::new(config, store.clone(), store, handler, integrator, tickets);
//! let run = controller.start("PROJ-123")?;
//! loop {
//!     match controller.advance(&run.run_id).await? {
//!         StageOutcome::Advanced { .. } => continue,
//!         other => break other,
//!     }
//! }
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod feedback;
pub mod knowledge;
pub mod normalizer;
pub mod oracle;
pub mod pipeline;
pub mod sources;
pub mod state;
pub mod validation;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use config::{ConfigError, ImplementationPolicy, PipelineConfig};
pub use error::{PipelineError, PipelineResult, StructuredError};
pub use feedback::{AdaptiveFeedbackIntegrator, Signature};
pub use knowledge::{
    FileKnowledgeBase, KnowledgeStore, LearnedPattern, MemoryKnowledgeBase, SharedKnowledgeStore,
};
pub use normalizer::{ArtifactNormalizer, NormalizerConfig};
pub use oracle::{Oracle, OracleError, OracleGateway, RetryPolicy, ScriptedOracle, SharedOracle};
pub use pipeline::{
    OracleStageHandler, PipelineController, ReviewDecision, RunStatus, Stage, StageHandler,
    StageOutcome, WorkflowState,
};
pub use sources::{RepoExcerpt, RepositorySource, SourceError, TicketSource};
pub use state::{ArtifactStore, JsonStateStore, MemoryStateStore, RunStore};
pub use validation::{ValidationEngine, ValidationResult, ValidationVerdict, Verdict};
