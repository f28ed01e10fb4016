//! Pipeline Controller: the single owner of run state
//!
//! Sequences stages, applies verdicts, suspends at the human review gate and
//! persists after every transition. Handlers produce artifacts and verdicts;
//! retries, escalation and persistence all happen here.
//!
//! ```text
//! step:  claim → load → verify refs → inputs → handler (no lock held)
//!        → reload → apply verdict → save → audit → release
//! ```
//!
//! A run is claimed for the duration of a step: first in an in-process
//! registry of cancellation tokens, then through the store's run lease, so
//! two processes never step the same run. A cancel from another task trips
//! the token directly; a cancel from another process leaves a request the
//! holder picks up while its stage is in flight.

use super::handler::{SharedStageHandler, StageExecution, StageRequest};
use super::transitions::{move_stage, set_status};
use super::types::{
    ArtifactHandle, ArtifactKind, HaltReport, ReviewDecision, RunStatus, Stage, StageArtifacts,
    StageOutcome, StageRecord, WorkflowState,
};
use crate::audit::{AuditEntry, AuditEvent, AuditLog};
use crate::config::{ImplementationPolicy, PipelineConfig};
use crate::context::extract_keywords;
use crate::error::{PipelineError, PipelineResult};
use crate::feedback::AdaptiveFeedbackIntegrator;
use crate::sources::{RepoExcerpt, SharedRepositorySource, SharedTicketSource};
use crate::state::{RunLease, SharedArtifactStore, SharedRunStore};
use crate::validation::{ValidationResult, ValidationVerdict, Verdict};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Check name reported when the ticket cannot be fetched
pub const TICKET_SOURCE: &str = "ticket-source";

/// Check name reported when repository excerpts cannot be read
pub const REPOSITORY_SOURCE: &str = "repository-source";

const DEFERRED_NOTE: &str = "deferred";

struct InFlight {
    cancel: CancellationToken,
    /// Tripped when the claim is released
    released: CancellationToken,
}

/// Releases a run's claim on drop, whatever path the step took
struct Claim<'a> {
    registry: &'a DashMap<String, InFlight>,
    run_id: String,
    cancel: CancellationToken,
    released: CancellationToken,
    lease: Option<RunLease>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // Lease goes first so a woken canceller can take it straight away
        drop(self.lease.take());
        self.registry.remove(&self.run_id);
        self.released.cancel();
    }
}

pub struct PipelineController {
    config: PipelineConfig,
    runs: SharedRunStore,
    artifacts: SharedArtifactStore,
    handler: SharedStageHandler,
    integrator: AdaptiveFeedbackIntegrator,
    tickets: SharedTicketSource,
    repository: Option<SharedRepositorySource>,
    audit: Option<Arc<AuditLog>>,
    in_flight: DashMap<String, InFlight>,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        runs: SharedRunStore,
        artifacts: SharedArtifactStore,
        handler: SharedStageHandler,
        integrator: AdaptiveFeedbackIntegrator,
        tickets: SharedTicketSource,
    ) -> Self {
        Self {
            config,
            runs,
            artifacts,
            handler,
            integrator,
            tickets,
            repository: None,
            audit: None,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_repository(mut self, repository: SharedRepositorySource) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn integrator(&self) -> &AdaptiveFeedbackIntegrator {
        &self.integrator
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Create a run for `ticket_id`, positioned at Setup.
    pub fn start(&self, ticket_id: &str) -> PipelineResult<WorkflowState> {
        let ticket_id = ticket_id.trim();
        if ticket_id.is_empty() {
            return Err(PipelineError::invalid_request("ticket id is empty"));
        }
        let state = WorkflowState::new(ticket_id);
        self.runs.save_run(&state)?;
        info!(run_id = %state.run_id, ticket = %ticket_id, "Run started");
        self.audit(AuditEntry::new(&state.run_id, AuditEvent::RunStarted).with_detail(ticket_id));
        Ok(state)
    }

    /// Run the current stage to a non-adapting outcome: soft failures are
    /// refined and retried inline until they pass, halt or escalate.
    pub async fn advance(&self, run_id: &str) -> PipelineResult<StageOutcome> {
        let claim = self.claim(run_id)?;
        loop {
            let state = self.load_live(run_id)?;
            let outcome = self.run_stage(state, &claim).await?;
            if !matches!(outcome, StageOutcome::Adapting { .. }) {
                return Ok(outcome);
            }
        }
    }

    /// Exactly one handler invocation (or gate evaluation).
    pub async fn step(&self, run_id: &str) -> PipelineResult<StageOutcome> {
        let claim = self.claim(run_id)?;
        let state = self.load_live(run_id)?;
        self.run_stage(state, &claim).await
    }

    /// Apply an operator decision at the human review gate.
    pub async fn resume(
        &self,
        run_id: &str,
        decision: ReviewDecision,
        feedback: Option<&str>,
    ) -> PipelineResult<StageOutcome> {
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());
        if decision == ReviewDecision::Modify && feedback.is_none() {
            return Err(PipelineError::invalid_request(
                "modify requires operator feedback",
            ));
        }

        let _claim = self.claim(run_id)?;
        let mut state = self.load_live(run_id)?;
        if state.status != RunStatus::AwaitingReview || !state.current_stage.is_review_gate() {
            return Err(PipelineError::transition(
                format!("{}@{}", state.status, state.current_stage),
                decision,
            ));
        }

        info!(run_id = %state.short_id(), %decision, "Review decision");
        self.audit(
            AuditEntry::new(&state.run_id, AuditEvent::ReviewDecided)
                .at(Stage::HumanReview)
                .with_detail(match feedback {
                    Some(fb) => format!("{decision}: {fb}"),
                    None => decision.to_string(),
                }),
        );
        let feedback = feedback.map(str::to_string);

        match decision {
            ReviewDecision::Approve => {
                state.record(
                    StageRecord::new(Stage::HumanReview, Verdict::Pass, 0)
                        .with_decision(decision, feedback),
                );
                set_status(&mut state, RunStatus::Active)?;
                move_stage(&mut state, Stage::Implementation)?;
                match self.config.implementation_policy {
                    ImplementationPolicy::Deferred => self.defer(state),
                    ImplementationPolicy::Execute => {
                        self.runs.save_run(&state)?;
                        Ok(StageOutcome::Resumed {
                            decision,
                            stage: Stage::Implementation,
                        })
                    }
                }
            }
            ReviewDecision::Reject => {
                state.record(
                    StageRecord::new(Stage::HumanReview, Verdict::HardFail, 0)
                        .with_decision(decision, feedback),
                );
                self.finish(&mut state, RunStatus::Rejected)?;
                Ok(StageOutcome::Finished {
                    stage: Stage::HumanReview,
                    status: RunStatus::Rejected,
                })
            }
            ReviewDecision::Modify => {
                let instruction = feedback.clone().unwrap_or_default();
                state.record(
                    StageRecord::new(Stage::HumanReview, Verdict::SoftFailAdapt, 0)
                        .with_decision(decision, feedback),
                );
                let key = state.context_delta.add_operator_feedback(&instruction);
                move_stage(&mut state, Stage::PlanGeneration)?;
                state.adapt_attempts.remove(&Stage::PlanGeneration);
                set_status(&mut state, RunStatus::Active)?;
                self.runs.save_run(&state)?;
                debug!(run_id = %state.short_id(), key = %key, "Operator feedback merged");
                Ok(StageOutcome::Resumed {
                    decision,
                    stage: Stage::PlanGeneration,
                })
            }
        }
    }

    /// Live or archived state of a run
    pub fn status(&self, run_id: &str) -> PipelineResult<WorkflowState> {
        if let Some(state) = self.runs.load_run(run_id)? {
            return Ok(state);
        }
        self.runs
            .load_archived(run_id)?
            .ok_or_else(|| PipelineError::run_not_found(run_id))
    }

    /// Cancel a run, abandoning any in-flight stage.
    pub async fn cancel(&self, run_id: &str) -> PipelineResult<WorkflowState> {
        let _claim = loop {
            if let Some(released) = self.trip(run_id) {
                info!(run_id = %run_id, "Cancelling in-flight stage");
                released.cancelled().await;
            }
            match self.claim(run_id) {
                Ok(claim) => break claim,
                Err(PipelineError::RunBusy { .. }) if !self.is_in_flight(run_id) => {
                    // Held by another process: ask it to let go, then wait for the lease
                    debug!(run_id = %run_id, "Requesting cancel from lease holder");
                    self.runs.request_cancel(run_id)?;
                    tokio::time::sleep(self.poll_interval()).await;
                }
                Err(PipelineError::RunBusy { .. }) => {}
                Err(e) => return Err(e),
            }
        };

        match self.runs.load_run(run_id)? {
            Some(mut state) if !state.is_terminal() => {
                self.finish(&mut state, RunStatus::Cancelled)?;
                Ok(state)
            }
            Some(state) => Err(terminal(&state)),
            // The stepping task may have finished the cancellation itself
            None => match self.runs.load_archived(run_id)? {
                Some(state) if state.status == RunStatus::Cancelled => Ok(state),
                Some(state) => Err(terminal(&state)),
                None => Err(PipelineError::run_not_found(run_id)),
            },
        }
    }

    /// Operator abandonment of an idle, non-terminal run.
    pub fn abandon(&self, run_id: &str) -> PipelineResult<WorkflowState> {
        let _claim = self.claim(run_id)?;
        let mut state = self.load_live(run_id)?;
        self.finish(&mut state, RunStatus::Abandoned)?;
        Ok(state)
    }

    /// Clear a halt so the stage can run again.
    pub fn retry(&self, run_id: &str) -> PipelineResult<WorkflowState> {
        let _claim = self.claim(run_id)?;
        let mut state = self.load_live(run_id)?;
        if state.status != RunStatus::Halted {
            return Err(PipelineError::transition(state.status, RunStatus::Active));
        }
        let stage = state.current_stage;
        set_status(&mut state, RunStatus::Active)?;
        state.halt = None;
        state.adapt_attempts.remove(&stage);
        self.runs.save_run(&state)?;
        info!(run_id = %state.short_id(), stage = %stage, "Halt cleared by operator");
        self.audit(
            AuditEntry::new(&state.run_id, AuditEvent::RunResumed)
                .at(stage)
                .with_detail("retry"),
        );
        Ok(state)
    }

    pub fn list_runs(&self) -> PipelineResult<Vec<WorkflowState>> {
        Ok(self.runs.list_runs()?)
    }

    /// Audit trail of a run, oldest first (empty without an audit log)
    pub fn history(&self, run_id: &str) -> PipelineResult<Vec<AuditEntry>> {
        match &self.audit {
            Some(log) => Ok(log.read_run(run_id)?),
            None => Ok(Vec::new()),
        }
    }

    /// Whether a step currently holds the run
    pub fn is_in_flight(&self, run_id: &str) -> bool {
        self.in_flight.contains_key(run_id)
    }

    // ------------------------------------------------------------------
    // Stage execution
    // ------------------------------------------------------------------

    async fn run_stage(
        &self,
        mut state: WorkflowState,
        claim: &Claim<'_>,
    ) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        match state.status {
            RunStatus::Halted => return halted_outcome(&state),
            RunStatus::AwaitingReview => return Ok(StageOutcome::AwaitingReview { stage }),
            _ => {}
        }

        if stage.is_review_gate() {
            set_status(&mut state, RunStatus::AwaitingReview)?;
            self.runs.save_run(&state)?;
            self.audit(AuditEntry::new(&state.run_id, AuditEvent::ReviewSuspended).at(stage));
            return Ok(StageOutcome::AwaitingReview { stage });
        }

        if stage == Stage::Implementation
            && self.config.implementation_policy == ImplementationPolicy::Deferred
        {
            return self.defer(state);
        }

        self.verify_artifacts(&state)?;
        let attempt = state.invocations_at(stage) + 1;

        let (ticket_text, input_failure) = self.ticket_text(&mut state).await?;
        let (excerpts, repo_failure) = match input_failure {
            None => self.excerpts(stage, &ticket_text).await,
            Some(_) => (Vec::new(), None),
        };
        let prior = self.prior_artifacts(&state)?;

        debug!(run_id = %state.short_id(), stage = %stage, attempt, "Executing stage");
        let execution = match input_failure.or(repo_failure) {
            Some(failure) => StageExecution::Failed {
                verdict: ValidationVerdict::hard_fail(failure),
            },
            None => {
                let request = StageRequest {
                    state: &state,
                    ticket_text: &ticket_text,
                    excerpts: &excerpts,
                    prior_artifacts: &prior,
                    cancel: &claim.cancel,
                };
                self.supervise(claim, self.handler.execute(request)).await
            }
        };

        match self.runs.load_run(&state.run_id)? {
            Some(live) if !live.is_terminal() => {}
            _ => {
                info!(run_id = %state.short_id(), stage = %stage, "Run ended elsewhere during stage");
                return Ok(StageOutcome::Cancelled { stage });
            }
        }
        let cancel_requested = self.runs.cancel_requested(&state.run_id)?;
        let execution = if claim.cancel.is_cancelled() || cancel_requested {
            StageExecution::Cancelled
        } else {
            execution
        };

        self.apply(state, attempt, execution)
    }

    /// Drive `work` while keeping the run lease fresh and picking up cancel
    /// requests left by other processes
    async fn supervise<F: Future>(&self, claim: &Claim<'_>, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => self.watch(claim),
            }
        }
    }

    fn watch(&self, claim: &Claim<'_>) {
        if let Some(lease) = &claim.lease {
            match lease.refresh() {
                Ok(true) => {}
                Ok(false) => warn!(run_id = %claim.run_id, "Run lease was taken over"),
                Err(e) => warn!(run_id = %claim.run_id, error = %e, "Failed to refresh run lease"),
            }
        }
        if claim.cancel.is_cancelled() {
            return;
        }
        match self.runs.cancel_requested(&claim.run_id) {
            Ok(true) => {
                info!(run_id = %claim.run_id, "Cancel requested by another process");
                claim.cancel.cancel();
            }
            Ok(false) => {}
            Err(e) => warn!(run_id = %claim.run_id, error = %e, "Failed to check for cancel request"),
        }
    }

    fn apply(
        &self,
        mut state: WorkflowState,
        attempt: u32,
        execution: StageExecution,
    ) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        match execution {
            StageExecution::Cancelled => {
                self.finish(&mut state, RunStatus::Cancelled)?;
                Ok(StageOutcome::Cancelled { stage })
            }
            StageExecution::Failed { verdict } => {
                state.record(
                    StageRecord::new(stage, Verdict::HardFail, attempt)
                        .with_note("stage produced no artifact"),
                );
                self.halt(state, verdict, false)
            }
            StageExecution::Completed {
                raw,
                normalized,
                verdict,
            } => {
                self.store_artifacts(&mut state, &raw, &normalized)?;
                info!(
                    run_id = %state.short_id(),
                    stage = %stage,
                    attempt,
                    verdict = %verdict.overall,
                    "Stage validated"
                );
                match verdict.overall {
                    Verdict::Pass => self.pass(state, attempt),
                    Verdict::HardFail => {
                        state.record(StageRecord::new(stage, Verdict::HardFail, attempt));
                        self.halt(state, verdict, false)
                    }
                    Verdict::SoftFailAdapt => self.adapt(state, attempt, verdict),
                }
            }
        }
    }

    /// Record the pass and move on, in one save
    fn pass(&self, mut state: WorkflowState, attempt: u32) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        state.record(StageRecord::new(stage, Verdict::Pass, attempt));

        let Some(next) = stage.next() else {
            self.finish(&mut state, RunStatus::Completed)?;
            return Ok(StageOutcome::Finished {
                stage,
                status: RunStatus::Completed,
            });
        };

        move_stage(&mut state, next)?;
        if next.is_review_gate() {
            set_status(&mut state, RunStatus::AwaitingReview)?;
        }
        self.runs.save_run(&state)?;
        self.audit(AuditEntry::new(&state.run_id, AuditEvent::StagePassed).at(stage));
        if next.is_review_gate() {
            info!(run_id = %state.short_id(), "Plan ready for human review");
            self.audit(AuditEntry::new(&state.run_id, AuditEvent::ReviewSuspended).at(next));
        }
        Ok(StageOutcome::Advanced { from: stage, to: next })
    }

    /// Refine the context for another attempt, or escalate at the ceiling
    fn adapt(
        &self,
        mut state: WorkflowState,
        attempt: u32,
        verdict: ValidationVerdict,
    ) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        let used = state.attempts_at(stage);
        let ceiling = self.config.retry_ceiling;

        if used >= ceiling {
            warn!(
                run_id = %state.short_id(),
                stage = %stage,
                ceiling,
                "Retry ceiling exhausted, escalating"
            );
            state.record(
                StageRecord::new(stage, Verdict::HardFail, attempt)
                    .with_note("retry ceiling exhausted"),
            );
            return self.halt(state, verdict, true);
        }

        let refined = self.integrator.refine(&verdict, &state.context_delta)?;
        state.record(
            StageRecord::new(stage, Verdict::SoftFailAdapt, attempt)
                .with_note(format!("refinement {}/{ceiling}", used + 1)),
        );
        state.context_delta = refined;
        state.adapt_attempts.insert(stage, used + 1);
        self.runs.save_run(&state)?;

        info!(
            run_id = %state.short_id(),
            stage = %stage,
            attempt = used + 1,
            ceiling,
            refinements = state.context_delta.len(),
            "Soft failure, context refined"
        );
        self.audit(
            AuditEntry::new(&state.run_id, AuditEvent::StageAdapting)
                .at(stage)
                .with_detail(format!("{}/{ceiling}", used + 1)),
        );
        Ok(StageOutcome::Adapting {
            stage,
            attempt: used + 1,
            ceiling,
        })
    }

    /// Stop automatic progress; the last history record already explains why
    fn halt(
        &self,
        mut state: WorkflowState,
        verdict: ValidationVerdict,
        escalated: bool,
    ) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        let reason = if escalated {
            format!(
                "soft failures persisted after {} refinements",
                self.config.retry_ceiling
            )
        } else {
            let failed: Vec<&str> = verdict
                .results
                .iter()
                .filter(|r| r.is_critical_failure())
                .map(|r| r.check_name.as_str())
                .collect();
            format!("critical check failed: {}", failed.join(", "))
        };

        set_status(&mut state, RunStatus::Halted)?;
        state.halt = Some(HaltReport {
            stage,
            results: verdict.results.clone(),
            escalated,
            reason: reason.clone(),
            at: Utc::now(),
        });
        self.runs.save_run(&state)?;

        warn!(run_id = %state.short_id(), stage = %stage, escalated, reason = %reason, "Run halted");
        self.audit(
            AuditEntry::new(&state.run_id, AuditEvent::StageHalted)
                .at(stage)
                .with_detail(reason),
        );
        Ok(StageOutcome::Halted {
            stage,
            results: verdict.results,
            escalated,
        })
    }

    /// Implementation under the deferred policy: no oracle call, run ends
    fn defer(&self, mut state: WorkflowState) -> PipelineResult<StageOutcome> {
        let stage = state.current_stage;
        state.record(StageRecord::new(stage, Verdict::Pass, 0).with_note(DEFERRED_NOTE));
        self.finish(&mut state, RunStatus::Deferred)?;
        Ok(StageOutcome::Finished {
            stage,
            status: RunStatus::Deferred,
        })
    }

    /// Terminal status, archive, purge artifacts
    fn finish(&self, state: &mut WorkflowState, status: RunStatus) -> PipelineResult<()> {
        if state.status != status {
            set_status(state, status)?;
        }
        self.runs.archive_run(state)?;
        let purged = self.artifacts.purge_run(&state.run_id)?;
        info!(
            run_id = %state.short_id(),
            stage = %state.current_stage,
            %status,
            purged,
            "Run archived"
        );

        let event = if status == RunStatus::Cancelled {
            AuditEvent::RunCancelled
        } else {
            AuditEvent::RunTerminal
        };
        self.audit(
            AuditEntry::new(&state.run_id, event)
                .at(state.current_stage)
                .with_detail(status.to_string()),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inputs and artifacts
    // ------------------------------------------------------------------

    /// Ticket text, fetched and captured on first use
    async fn ticket_text(
        &self,
        state: &mut WorkflowState,
    ) -> PipelineResult<(String, Option<ValidationResult>)> {
        if let Some(handle) = &state.input_ref {
            let text = self.artifacts.get_artifact(handle)?.ok_or_else(|| {
                PipelineError::consistency(format!("ticket input {} is missing", handle.key()))
            })?;
            return Ok((text, None));
        }

        match self.tickets.fetch(&state.ticket_id).await {
            Ok(text) => {
                let handle = ArtifactHandle {
                    run_id: state.run_id.clone(),
                    stage: state.current_stage,
                    kind: ArtifactKind::Input,
                    revision: 0,
                };
                self.artifacts.put_artifact(&handle, &text)?;
                state.input_ref = Some(handle);
                state.touch();
                self.runs.save_run(state)?;
                Ok((text, None))
            }
            Err(e) => {
                warn!(run_id = %state.short_id(), ticket = %state.ticket_id, error = %e, "Ticket fetch failed");
                Ok((
                    String::new(),
                    Some(ValidationResult::fail(TICKET_SOURCE, e.to_string()).critical(true)),
                ))
            }
        }
    }

    async fn excerpts(
        &self,
        stage: Stage,
        ticket_text: &str,
    ) -> (Vec<RepoExcerpt>, Option<ValidationResult>) {
        let Some(repository) = self.repository.as_ref().filter(|_| stage == Stage::RepoAccess)
        else {
            return (Vec::new(), None);
        };
        let keywords = extract_keywords(ticket_text, self.config.assembler.max_keywords);
        match repository.excerpts(&keywords).await {
            Ok(excerpts) => {
                debug!(keywords = keywords.len(), excerpts = excerpts.len(), "Repository excerpts");
                (excerpts, None)
            }
            Err(e) => (
                Vec::new(),
                Some(ValidationResult::fail(REPOSITORY_SOURCE, e.to_string()).critical(true)),
            ),
        }
    }

    /// Normalized artifacts of the stages before the current one
    fn prior_artifacts(&self, state: &WorkflowState) -> PipelineResult<Vec<(Stage, String)>> {
        state
            .artifact_refs
            .iter()
            .filter(|(stage, _)| **stage < state.current_stage)
            .map(|(stage, refs)| {
                let text = self.artifacts.get_artifact(&refs.normalized)?.ok_or_else(|| {
                    PipelineError::consistency(format!(
                        "artifact {} vanished",
                        refs.normalized.key()
                    ))
                })?;
                Ok((*stage, text))
            })
            .collect()
    }

    fn store_artifacts(
        &self,
        state: &mut WorkflowState,
        raw: &str,
        normalized: &str,
    ) -> PipelineResult<()> {
        let stage = state.current_stage;
        let revision = state.next_revision(stage);
        let handle = |kind| ArtifactHandle {
            run_id: state.run_id.clone(),
            stage,
            kind,
            revision,
        };
        let refs = StageArtifacts {
            raw: handle(ArtifactKind::Raw),
            normalized: handle(ArtifactKind::Normalized),
        };
        self.artifacts.put_artifact(&refs.raw, raw)?;
        self.artifacts.put_artifact(&refs.normalized, normalized)?;
        state.artifact_refs.insert(stage, refs);
        Ok(())
    }

    /// Every reference must resolve before anything runs
    fn verify_artifacts(&self, state: &WorkflowState) -> PipelineResult<()> {
        for handle in state.all_artifact_handles() {
            if handle.run_id != state.run_id || !self.artifacts.has_artifact(handle)? {
                return Err(PipelineError::consistency(format!(
                    "run {} references missing artifact {}",
                    state.run_id,
                    handle.key()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn claim(&self, run_id: &str) -> PipelineResult<Claim<'_>> {
        let busy = || PipelineError::RunBusy {
            run_id: run_id.to_string(),
        };
        let Entry::Vacant(slot) = self.in_flight.entry(run_id.to_string()) else {
            return Err(busy());
        };
        let cancel = CancellationToken::new();
        let released = CancellationToken::new();
        slot.insert(InFlight {
            cancel: cancel.clone(),
            released: released.clone(),
        });
        let mut claim = Claim {
            registry: &self.in_flight,
            run_id: run_id.to_string(),
            cancel,
            released,
            lease: None,
        };

        // Dropping the claim on any early return frees the registry slot
        claim.lease = Some(self.runs.try_lease(run_id)?.ok_or_else(busy)?);
        // A request aimed at an earlier holder does not carry over
        self.runs.clear_cancel(run_id)?;
        Ok(claim)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.lease_poll_ms.max(1))
    }

    /// Trip the token of an in-flight run; returns its release signal
    fn trip(&self, run_id: &str) -> Option<CancellationToken> {
        let in_flight = self.in_flight.get(run_id)?;
        in_flight.cancel.cancel();
        Some(in_flight.released.clone())
    }

    fn load_live(&self, run_id: &str) -> PipelineResult<WorkflowState> {
        match self.runs.load_run(run_id)? {
            Some(state) if state.is_terminal() => Err(terminal(&state)),
            Some(state) => Ok(state),
            None => match self.runs.load_archived(run_id)? {
                Some(state) => Err(terminal(&state)),
                None => Err(PipelineError::run_not_found(run_id)),
            },
        }
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(&entry) {
                warn!(run_id = %entry.run_id, error = %e, "Failed to append audit entry");
            }
        }
    }
}

fn terminal(state: &WorkflowState) -> PipelineError {
    PipelineError::TerminalRun {
        run_id: state.run_id.clone(),
        status: state.status.to_string(),
    }
}

fn halted_outcome(state: &WorkflowState) -> PipelineResult<StageOutcome> {
    let report = state.halt.as_ref().ok_or_else(|| {
        PipelineError::consistency(format!("run {} is halted without a report", state.run_id))
    })?;
    Ok(StageOutcome::Halted {
        stage: report.stage,
        results: report.results.clone(),
        escalated: report.escalated,
    })
}
