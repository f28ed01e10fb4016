//! Stage pipeline
//!
//! - [`types`]: stages, statuses, workflow state and outcomes
//! - [`transitions`]: legal stage and status moves
//! - [`handler`]: what executing a stage means
//! - [`controller`]: sequencing, verdicts, review gate, persistence

pub mod controller;
pub mod handler;
pub mod transitions;
pub mod types;

pub use controller::{PipelineController, REPOSITORY_SOURCE, TICKET_SOURCE};
pub use handler::{
    OracleStageHandler, SharedStageHandler, StageExecution, StageHandler, StageRequest,
    ORACLE_CHECK,
};
pub use transitions::{is_legal_stage_move, is_legal_status_move};
pub use types::{
    ArtifactHandle, ArtifactKind, HaltReport, ReviewDecision, RunStatus, Stage, StageArtifacts,
    StageOutcome, StageRecord, WorkflowState,
};
