//! Legal moves of a run: stage edges and status edges.
//!
//! ```text
//! Stage:   setup → repo_access → analysis → plan_generation → human_review
//!          → implementation → quality_validation
//!          human_review → plan_generation            (modify)
//!
//! Status:  active          → any
//!          awaiting_review → active | rejected | deferred | cancelled | abandoned
//!          halted          → active | cancelled | abandoned
//!          terminal        → (none)
//! ```
//!
//! The controller checks every mutation against these tables before saving.

use super::types::{RunStatus, Stage, WorkflowState};
use crate::error::{PipelineError, PipelineResult};

pub fn is_legal_stage_move(from: Stage, to: Stage) -> bool {
    from.next() == Some(to) || (from == Stage::HumanReview && to == Stage::PlanGeneration)
}

pub fn is_legal_status_move(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;

    if from.is_terminal() {
        return false;
    }
    if from == to {
        return true;
    }

    match from {
        Active => true,
        AwaitingReview => matches!(to, Active | Rejected | Deferred | Cancelled | Abandoned),
        Halted => matches!(to, Active | Cancelled | Abandoned),
        _ => false,
    }
}

/// Move the run to `to`, or fail without touching it
pub fn move_stage(state: &mut WorkflowState, to: Stage) -> PipelineResult<()> {
    if !is_legal_stage_move(state.current_stage, to) {
        return Err(PipelineError::transition(state.current_stage, to));
    }
    state.current_stage = to;
    state.touch();
    Ok(())
}

/// Set the run status, or fail without touching it
pub fn set_status(state: &mut WorkflowState, to: RunStatus) -> PipelineResult<()> {
    if !is_legal_status_move(state.status, to) {
        return Err(PipelineError::transition(state.status, to));
    }
    state.status = to;
    if to.is_terminal() {
        state.resumable = false;
    }
    state.touch();
    Ok(())
}
