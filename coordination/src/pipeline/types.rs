//! Core types for the stage pipeline
//!
//! `WorkflowState` is the persisted snapshot of one run. Only the
//! controller mutates it, and every mutation is followed by a save.

use crate::context::ContextDelta;
use crate::validation::{ValidationResult, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// One step of the fixed pipeline sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    RepoAccess,
    Analysis,
    PlanGeneration,
    /// Mandatory human gate; never executed by a handler
    HumanReview,
    Implementation,
    QualityValidation,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Setup,
        Stage::RepoAccess,
        Stage::Analysis,
        Stage::PlanGeneration,
        Stage::HumanReview,
        Stage::Implementation,
        Stage::QualityValidation,
    ];

    /// Next stage in the fixed sequence
    pub fn next(self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn is_review_gate(self) -> bool {
        self == Stage::HumanReview
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::RepoAccess => "repo_access",
            Self::Analysis => "analysis",
            Self::PlanGeneration => "plan_generation",
            Self::HumanReview => "human_review",
            Self::Implementation => "implementation",
            Self::QualityValidation => "quality_validation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    /// Suspended at the human review gate
    AwaitingReview,
    /// Hard failure; waits for operator intervention
    Halted,
    Rejected,
    /// Implementation stage reached while the policy defers it
    Deferred,
    Completed,
    Cancelled,
    Abandoned,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Deferred | Self::Completed | Self::Cancelled | Self::Abandoned
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::AwaitingReview => write!(f, "awaiting_review"),
            Self::Halted => write!(f, "halted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Deferred => write!(f, "deferred"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Operator decision at the human review gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    /// Re-enter plan generation with operator feedback
    Modify,
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Modify => write!(f, "modify"),
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "modify" => Ok(Self::Modify),
            other => Err(format!(
                "unknown review decision '{other}' (expected approve, reject or modify)"
            )),
        }
    }
}

/// One entry of the replayable stage history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
    /// Handler invocation number for this stage (0 for gate decisions)
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl StageRecord {
    pub fn new(stage: Stage, verdict: Verdict, attempt: u32) -> Self {
        Self {
            stage,
            verdict,
            timestamp: Utc::now(),
            attempt,
            note: None,
            decision: None,
            feedback: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_decision(mut self, decision: ReviewDecision, feedback: Option<String>) -> Self {
        self.decision = Some(decision);
        self.feedback = feedback;
        self
    }
}

/// What an artifact blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Ticket text fetched at setup
    Input,
    Raw,
    Normalized,
}

/// Reference to an immutable artifact blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub run_id: String,
    pub stage: Stage,
    pub kind: ArtifactKind,
    pub revision: u32,
}

impl ArtifactHandle {
    /// Storage key, unique per (run, stage, kind, revision)
    pub fn key(&self) -> String {
        let kind = match self.kind {
            ArtifactKind::Input => "input",
            ArtifactKind::Raw => "raw",
            ArtifactKind::Normalized => "normalized",
        };
        format!("{}.{}.{}", self.stage, kind, self.revision)
    }
}

/// The artifact pair produced by one stage execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageArtifacts {
    pub raw: ArtifactHandle,
    pub normalized: ArtifactHandle,
}

impl StageArtifacts {
    pub fn revision(&self) -> u32 {
        self.normalized.revision
    }
}

/// Why a run stopped making automatic progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReport {
    pub stage: Stage,
    /// Ordered results of the validation pass that caused the halt
    pub results: Vec<ValidationResult>,
    /// True when the adaptive loop ran out of budget
    pub escalated: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Persisted state of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Unique run identifier (UUID v4)
    pub run_id: String,
    pub ticket_id: String,
    pub current_stage: Stage,
    pub status: RunStatus,
    pub stage_history: Vec<StageRecord>,
    pub artifact_refs: BTreeMap<Stage, StageArtifacts>,
    /// Ticket text captured when the run started executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ref: Option<ArtifactHandle>,
    /// False once the run can no longer be advanced
    pub resumable: bool,
    /// Refinements accumulated across every retry of this run
    #[serde(default)]
    pub context_delta: ContextDelta,
    /// Refinement attempts used, per stage
    #[serde(default)]
    pub adapt_attempts: BTreeMap<Stage, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            ticket_id: ticket_id.into(),
            current_stage: Stage::Setup,
            status: RunStatus::Active,
            stage_history: Vec::new(),
            artifact_refs: BTreeMap::new(),
            input_ref: None,
            resumable: true,
            context_delta: ContextDelta::default(),
            adapt_attempts: BTreeMap::new(),
            halt: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn short_id(&self) -> &str {
        &self.run_id[..8.min(self.run_id.len())]
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record(&mut self, record: StageRecord) {
        self.stage_history.push(record);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn attempts_at(&self, stage: Stage) -> u32 {
        self.adapt_attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Next revision number for a stage's artifacts
    pub fn next_revision(&self, stage: Stage) -> u32 {
        self.artifact_refs
            .get(&stage)
            .map(|a| a.revision() + 1)
            .unwrap_or(1)
    }

    /// Number of handler invocations recorded for the stage since it was last entered
    pub fn invocations_at(&self, stage: Stage) -> u32 {
        self.stage_history
            .iter()
            .rev()
            .take_while(|r| r.stage == stage && r.decision.is_none())
            .count() as u32
    }

    /// Every artifact handle the state refers to
    pub fn all_artifact_handles(&self) -> Vec<&ArtifactHandle> {
        self.input_ref
            .iter()
            .chain(
                self.artifact_refs
                    .values()
                    .flat_map(|a| [&a.raw, &a.normalized]),
            )
            .collect()
    }

    /// Stages that passed, in order
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.stage_history
            .iter()
            .filter(|r| r.verdict == Verdict::Pass)
            .map(|r| r.stage)
            .collect()
    }
}

/// What a single `advance`/`step`/`resume` call achieved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage passed; run moved on
    Advanced { from: Stage, to: Stage },
    /// Run is suspended at the human gate
    AwaitingReview { stage: Stage },
    /// Soft failure refined; the stage will be re-invoked
    Adapting {
        stage: Stage,
        attempt: u32,
        ceiling: u32,
    },
    /// Hard failure (direct or escalated); operator must intervene
    Halted {
        stage: Stage,
        results: Vec<ValidationResult>,
        escalated: bool,
    },
    /// Run reached a terminal status
    Finished { stage: Stage, status: RunStatus },
    /// Operator cancelled the run mid-stage
    Cancelled { stage: Stage },
    /// Review decision applied; the run continues at `stage`
    Resumed {
        decision: ReviewDecision,
        stage: Stage,
    },
}

impl StageOutcome {
    /// Exit code convention for synchronous callers:
    /// 0 = pass/advanced, 1 = hard_fail, 2 = in progress (poll `status`).
    ///
    /// Terminal statuses reached through an operator decision are not
    /// failures; a step interrupted by cancellation is.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Advanced { .. } | Self::Resumed { .. } | Self::Finished { .. } => 0,
            Self::Halted { .. } | Self::Cancelled { .. } => 1,
            Self::AwaitingReview { .. } | Self::Adapting { .. } => 2,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Advanced { from, .. } => *from,
            Self::AwaitingReview { stage }
            | Self::Adapting { stage, .. }
            | Self::Halted { stage, .. }
            | Self::Finished { stage, .. }
            | Self::Cancelled { stage }
            | Self::Resumed { stage, .. } => *stage,
        }
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advanced { from, to } => write!(f, "{from} passed, now at {to}"),
            Self::AwaitingReview { stage } => write!(f, "suspended at {stage} for human review"),
            Self::Adapting {
                stage,
                attempt,
                ceiling,
            } => write!(f, "{stage} refining context (attempt {attempt}/{ceiling})"),
            Self::Halted {
                stage, escalated, ..
            } => {
                if *escalated {
                    write!(f, "{stage} halted: adaptive retries exhausted")
                } else {
                    write!(f, "{stage} halted: critical check failed")
                }
            }
            Self::Finished { stage, status } => write!(f, "run {status} at {stage}"),
            Self::Cancelled { stage } => write!(f, "run cancelled during {stage}"),
            Self::Resumed { decision, stage } => write!(f, "review decision {decision} applied, now at {stage}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence() {
        assert_eq!(Stage::Setup.next(), Some(Stage::RepoAccess));
        assert_eq!(Stage::PlanGeneration.next(), Some(Stage::HumanReview));
        assert_eq!(Stage::QualityValidation.next(), None);
        assert_eq!("plan_generation".parse::<Stage>(), Ok(Stage::PlanGeneration));
    }

    #[test]
    fn test_exit_codes() {
        let halted = StageOutcome::Halted {
            stage: Stage::Setup,
            results: vec![],
            escalated: false,
        };
        assert_eq!(halted.exit_code(), 1);
        assert_eq!(
            StageOutcome::Adapting {
                stage: Stage::Analysis,
                attempt: 1,
                ceiling: 3
            }
            .exit_code(),
            2
        );
        assert_eq!(
            StageOutcome::Advanced {
                from: Stage::Setup,
                to: Stage::RepoAccess
            }
            .exit_code(),
            0
        );
    }

    #[test]
    fn test_state_roundtrips_with_stage_keys() {
        let mut state = WorkflowState::new("TICKET-1");
        state.adapt_attempts.insert(Stage::Analysis, 2);
        let json = serde_json::to_string(&state).unwrap();
        let loaded: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.attempts_at(Stage::Analysis), 2);
    }

    #[test]
    fn test_review_decision_parse() {
        assert_eq!("Modify".parse::<ReviewDecision>(), Ok(ReviewDecision::Modify));
        assert!("maybe".parse::<ReviewDecision>().is_err());
    }
}
