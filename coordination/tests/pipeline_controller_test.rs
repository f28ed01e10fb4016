//! Pipeline controller integration tests
//!
//! Drives runs through the controller with deterministic stage handlers:
//! - persistence and resume at the next stage
//! - adaptive loop bounded by the retry ceiling
//! - human review decisions (approve, reject, modify)
//! - implementation policy, cancellation, busy runs, corrupt state
//! - two controllers sharing one state directory

use plan_coordination::audit::{AuditEvent, AuditLog};
use plan_coordination::config::{ImplementationPolicy, PipelineConfig};
use plan_coordination::context::{ContextDelta, RefinementSource, Taxonomy};
use plan_coordination::feedback::AdaptiveFeedbackIntegrator;
use plan_coordination::knowledge::{
    FileKnowledgeBase, KnowledgeStore, MemoryKnowledgeBase, SharedKnowledgeStore,
};
use plan_coordination::oracle::ScriptedOracle;
use plan_coordination::pipeline::{
    OracleStageHandler, PipelineController, ReviewDecision, RunStatus, Stage, StageExecution,
    StageHandler, StageOutcome, StageRequest, TICKET_SOURCE,
};
use plan_coordination::sources::StaticTicketSource;
use plan_coordination::state::{ArtifactStore, JsonStateStore, MemoryStateStore, RunStore};
use plan_coordination::validation::{
    reduce, ReductionPolicy, ValidationResult, Verdict, ENVIRONMENT_READINESS,
    FEATURE_AVAILABILITY,
};
use plan_coordination::{PipelineError, ValidationVerdict};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::Notify;

const TICKET: &str = "Add Route support for the demo operator so the dashboard is reachable";

const GOOD_PLAN: &str = "\
| Step | Expected Result |
|------|-----------------|
| Create namespace demo | Namespace demo is Active |
| Apply route.yaml | Route demo is admitted by the router |
";

// ── Test handler ──────────────────────────────────────────────────────

type Decide = dyn Fn(Stage, usize) -> Verdict + Send + Sync;

/// Handler whose verdict is a function of (stage, nth invocation of that stage)
struct TestHandler {
    decide: Box<Decide>,
    calls: Mutex<HashMap<Stage, usize>>,
    deltas: Mutex<Vec<(Stage, ContextDelta)>>,
}

impl TestHandler {
    fn new(decide: impl Fn(Stage, usize) -> Verdict + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            decide: Box::new(decide),
            calls: Mutex::new(HashMap::new()),
            deltas: Mutex::new(Vec::new()),
        })
    }

    fn passing() -> Arc<Self> {
        Self::new(|_, _| Verdict::Pass)
    }

    fn calls(&self, stage: Stage) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    fn last_delta(&self, stage: Stage) -> ContextDelta {
        self.deltas
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _)| *s == stage)
            .map(|(_, d)| d.clone())
            .unwrap()
    }
}

fn verdict_for(kind: Verdict) -> ValidationVerdict {
    let results = match kind {
        Verdict::Pass => vec![ValidationResult::pass("artifact-shape", "ok").critical(true)],
        Verdict::SoftFailAdapt => vec![ValidationResult::soft_fail(
            FEATURE_AVAILABILITY,
            "target feature appears unimplemented; missing: routes.route.openshift.io",
        )
        .with_evidence(json!({ "subjects": ["routes.route.openshift.io"] }))],
        Verdict::HardFail => vec![
            ValidationResult::fail(ENVIRONMENT_READINESS, "environment unreachable").critical(true),
            ValidationResult::soft_fail(FEATURE_AVAILABILITY, "feature signature not found"),
        ],
    };
    reduce(results, &ReductionPolicy::default())
}

#[async_trait::async_trait]
impl StageHandler for TestHandler {
    async fn execute(&self, request: StageRequest<'_>) -> StageExecution {
        let stage = request.stage();
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(stage).or_default();
            *n += 1;
            *n
        };
        self.deltas
            .lock()
            .unwrap()
            .push((stage, request.state.context_delta.clone()));
        StageExecution::Completed {
            raw: format!("{stage} raw #{nth}"),
            normalized: GOOD_PLAN.to_string(),
            verdict: verdict_for((self.decide)(stage, nth)),
        }
    }
}

/// Handler that parks until its run is cancelled
struct ParkedHandler {
    entered: Notify,
}

#[async_trait::async_trait]
impl StageHandler for ParkedHandler {
    async fn execute(&self, request: StageRequest<'_>) -> StageExecution {
        self.entered.notify_one();
        request.cancel.cancelled().await;
        StageExecution::Cancelled
    }
}

// ── Wiring ────────────────────────────────────────────────────────────

struct Fixture {
    controller: Arc<PipelineController>,
    store: Arc<MemoryStateStore>,
    kb: Arc<MemoryKnowledgeBase>,
}

fn fixture(handler: Arc<dyn StageHandler>, config: PipelineConfig) -> Fixture {
    let store = MemoryStateStore::new().shared();
    let kb = Arc::new(MemoryKnowledgeBase::new());
    let controller = PipelineController::new(
        config,
        store.clone(),
        store.clone(),
        handler,
        AdaptiveFeedbackIntegrator::new(kb.clone()),
        Arc::new(StaticTicketSource::new().with_ticket("T-1", TICKET)),
    );
    Fixture {
        controller: Arc::new(controller),
        store,
        kb,
    }
}

async fn drive_to_review(controller: &PipelineController, run_id: &str) {
    loop {
        match controller.advance(run_id).await.unwrap() {
            StageOutcome::Advanced {
                to: Stage::HumanReview,
                ..
            } => return,
            StageOutcome::Advanced { .. } => continue,
            other => panic!("unexpected outcome: {other}"),
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_reloaded_run_resumes_at_next_stage() {
    let dir = tempdir().unwrap();
    let build = |handler: Arc<TestHandler>| {
        let store = JsonStateStore::open(dir.path().join("state")).unwrap().shared();
        let kb: SharedKnowledgeStore =
            Arc::new(FileKnowledgeBase::open(dir.path().join("knowledge")).unwrap());
        PipelineController::new(
            PipelineConfig::default(),
            store.clone(),
            store,
            handler,
            AdaptiveFeedbackIntegrator::new(kb),
            Arc::new(StaticTicketSource::new().with_ticket("T-1", TICKET)),
        )
    };

    let first = TestHandler::passing();
    let run_id = {
        let controller = build(first.clone());
        let run = controller.start("T-1").unwrap();
        let outcome = controller.advance(&run.run_id).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Advanced {
                from: Stage::Setup,
                to: Stage::RepoAccess
            }
        );
        run.run_id
    };

    // Fresh process: nothing shared but the directory
    let second = TestHandler::passing();
    let controller = build(second.clone());
    let state = controller.status(&run_id).unwrap();
    assert_eq!(state.current_stage, Stage::RepoAccess);
    assert!(state.input_ref.is_some());

    let outcome = controller.advance(&run_id).await.unwrap();
    assert_eq!(outcome.stage(), Stage::RepoAccess);
    assert_eq!(second.calls(Stage::Setup), 0);
    assert_eq!(second.calls(Stage::RepoAccess), 1);
    assert_eq!(first.calls(Stage::Setup), 1);
}

// ── Adaptive loop ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_ceiling_escalates_after_exactly_three_refinements() {
    let handler = TestHandler::new(|_, _| Verdict::SoftFailAdapt);
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();

    let outcome = f.controller.advance(&run.run_id).await.unwrap();
    let StageOutcome::Halted {
        stage,
        results,
        escalated,
    } = outcome
    else {
        panic!("expected halt");
    };
    assert_eq!(stage, Stage::Setup);
    assert!(escalated);
    assert_eq!(results[0].check_name, FEATURE_AVAILABILITY);

    // 1 original attempt + 3 refined retries
    assert_eq!(handler.calls(Stage::Setup), 4);

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.status, RunStatus::Halted);
    assert_eq!(state.attempts_at(Stage::Setup), 3);
    let adapted = state
        .stage_history
        .iter()
        .filter(|r| r.verdict == Verdict::SoftFailAdapt)
        .count();
    assert_eq!(adapted, 3);
    assert!(state.halt.as_ref().unwrap().escalated);

    let patterns = f.kb.list().unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].occurrences, 3);
}

#[tokio::test]
async fn test_step_reports_each_refinement() {
    let handler = TestHandler::new(|_, _| Verdict::SoftFailAdapt);
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();

    for attempt in 1..=3 {
        let outcome = f.controller.step(&run.run_id).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Adapting {
                stage: Stage::Setup,
                attempt,
                ceiling: 3
            }
        );
        assert_eq!(outcome.exit_code(), 2);
    }
    let outcome = f.controller.step(&run.run_id).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Halted { escalated: true, .. }));
    assert_eq!(outcome.exit_code(), 1);

    // Refinements carry rising confidence into later attempts
    let delta = handler.last_delta(Stage::Setup);
    assert_eq!(delta.len(), 1);
    assert!(delta.refinements()[0].confidence > 0.3);
}

#[tokio::test]
async fn test_hard_fail_halts_until_operator_retry() {
    let handler = TestHandler::new(|stage, nth| match (stage, nth) {
        (Stage::Setup, 1) => Verdict::HardFail,
        _ => Verdict::Pass,
    });
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();

    let outcome = f.controller.advance(&run.run_id).await.unwrap();
    let StageOutcome::Halted {
        results, escalated, ..
    } = &outcome
    else {
        panic!("expected halt");
    };
    assert!(!escalated);
    assert_eq!(results.len(), 2, "halt keeps every result, in order");
    assert_eq!(results[0].check_name, ENVIRONMENT_READINESS);

    // No automatic progress while halted
    assert_eq!(f.controller.advance(&run.run_id).await.unwrap(), outcome);
    assert_eq!(handler.calls(Stage::Setup), 1);

    let state = f.controller.retry(&run.run_id).unwrap();
    assert_eq!(state.status, RunStatus::Active);
    assert!(state.halt.is_none());

    let outcome = f.controller.advance(&run.run_id).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(handler.calls(Stage::Setup), 2);
}

#[tokio::test]
async fn test_retry_requires_halted_run() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    let err = f.controller.retry(&run.run_id).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
}

// ── Human review ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_modify_reenters_plan_generation_keeping_prior_deltas() {
    // First plan attempt is soft, so a learned refinement exists before review
    let handler = TestHandler::new(|stage, nth| match (stage, nth) {
        (Stage::PlanGeneration, 1) => Verdict::SoftFailAdapt,
        _ => Verdict::Pass,
    });
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    drive_to_review(&f.controller, &run.run_id).await;

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.status, RunStatus::AwaitingReview);
    assert_eq!(state.context_delta.len(), 1);
    assert_eq!(
        f.controller.advance(&run.run_id).await.unwrap(),
        StageOutcome::AwaitingReview {
            stage: Stage::HumanReview
        }
    );

    let err = f
        .controller
        .resume(&run.run_id, ReviewDecision::Modify, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest { .. }));

    let outcome = f
        .controller
        .resume(&run.run_id, ReviewDecision::Modify, Some("add RBAC check"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Resumed {
            decision: ReviewDecision::Modify,
            stage: Stage::PlanGeneration
        }
    );

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.current_stage, Stage::PlanGeneration);
    assert_eq!(state.status, RunStatus::Active);
    assert_eq!(state.attempts_at(Stage::PlanGeneration), 0);
    let review = state.stage_history.last().unwrap();
    assert_eq!(review.decision, Some(ReviewDecision::Modify));
    assert_eq!(review.feedback.as_deref(), Some("add RBAC check"));

    let outcome = f.controller.advance(&run.run_id).await.unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Advanced {
            from: Stage::PlanGeneration,
            to: Stage::HumanReview
        }
    );

    let seen = handler.last_delta(Stage::PlanGeneration);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.get("operator:1").unwrap().instruction, "add RBAC check");
    assert!(seen
        .refinements()
        .iter()
        .any(|r| r.source == RefinementSource::Synthesized));
    assert_eq!(seen.ordered()[0].source, RefinementSource::Operator);
}

#[tokio::test]
async fn test_approve_defers_implementation_by_default() {
    let handler = TestHandler::passing();
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    drive_to_review(&f.controller, &run.run_id).await;
    let plan_ref = f
        .controller
        .status(&run.run_id)
        .unwrap()
        .artifact_refs[&Stage::PlanGeneration]
        .normalized
        .clone();

    let outcome = f
        .controller
        .resume(&run.run_id, ReviewDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Finished {
            stage: Stage::Implementation,
            status: RunStatus::Deferred
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(handler.calls(Stage::Implementation), 0);

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.status, RunStatus::Deferred);
    assert!(!state.resumable);
    let last = state.stage_history.last().unwrap();
    assert_eq!(last.stage, Stage::Implementation);
    assert_eq!(last.verdict, Verdict::Pass);
    assert_eq!(last.note.as_deref(), Some("deferred"));

    // Archived: gone from the live list, artifacts purged
    assert!(f.controller.list_runs().unwrap().is_empty());
    assert!(f.store.load_run(&run.run_id).unwrap().is_none());
    assert!(f.store.get_artifact(&plan_ref).unwrap().is_none());

    let err = f.controller.advance(&run.run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::TerminalRun { .. }));
}

#[tokio::test]
async fn test_execute_policy_runs_to_completion() {
    let config = PipelineConfig {
        implementation_policy: ImplementationPolicy::Execute,
        ..PipelineConfig::default()
    };
    let handler = TestHandler::passing();
    let f = fixture(handler.clone(), config);
    let run = f.controller.start("T-1").unwrap();
    drive_to_review(&f.controller, &run.run_id).await;

    let outcome = f
        .controller
        .resume(&run.run_id, ReviewDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Resumed {
            decision: ReviewDecision::Approve,
            stage: Stage::Implementation
        }
    );
    assert_eq!(
        f.controller.advance(&run.run_id).await.unwrap(),
        StageOutcome::Advanced {
            from: Stage::Implementation,
            to: Stage::QualityValidation
        }
    );
    assert_eq!(
        f.controller.advance(&run.run_id).await.unwrap(),
        StageOutcome::Finished {
            stage: Stage::QualityValidation,
            status: RunStatus::Completed
        }
    );

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.completed_stages().len(), Stage::ALL.len());
}

#[tokio::test]
async fn test_reject_ends_run() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    drive_to_review(&f.controller, &run.run_id).await;

    let outcome = f
        .controller
        .resume(&run.run_id, ReviewDecision::Reject, Some("wrong scope"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Finished {
            stage: Stage::HumanReview,
            status: RunStatus::Rejected
        }
    );
    assert_eq!(
        f.controller.status(&run.run_id).unwrap().status,
        RunStatus::Rejected
    );
}

#[tokio::test]
async fn test_resume_outside_review_is_rejected() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    let err = f
        .controller
        .resume(&run.run_id, ReviewDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
}

// ── Inputs and corruption ─────────────────────────────────────────────

#[tokio::test]
async fn test_ticket_fetch_failure_halts_setup() {
    let handler = TestHandler::passing();
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("UNKNOWN-7").unwrap();

    let outcome = f.controller.advance(&run.run_id).await.unwrap();
    let StageOutcome::Halted { stage, results, .. } = outcome else {
        panic!("expected halt");
    };
    assert_eq!(stage, Stage::Setup);
    assert_eq!(results[0].check_name, TICKET_SOURCE);
    assert!(results[0].critical);
    assert_eq!(handler.calls(Stage::Setup), 0);
}

#[tokio::test]
async fn test_missing_artifact_is_consistency_error() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();
    f.controller.advance(&run.run_id).await.unwrap();

    let state = f.controller.status(&run.run_id).unwrap();
    let handle = &state.artifact_refs[&Stage::Setup].normalized;
    assert!(f.store.remove_artifact(handle).unwrap());

    let err = f.controller.advance(&run.run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Consistency { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let err = f.controller.step("no-such-run").await.unwrap_err();
    assert!(matches!(err, PipelineError::RunNotFound { .. }));
    assert!(f.controller.start("   ").is_err());
}

// ── Concurrency and cancellation ──────────────────────────────────────

#[tokio::test]
async fn test_concurrent_step_is_busy_and_cancel_interrupts() {
    let handler = Arc::new(ParkedHandler {
        entered: Notify::new(),
    });
    let f = fixture(handler.clone(), PipelineConfig::default());
    let run = f.controller.start("T-1").unwrap();

    let controller = f.controller.clone();
    let run_id = run.run_id.clone();
    let stepping = tokio::spawn(async move { controller.advance(&run_id).await });
    handler.entered.notified().await;

    assert!(f.controller.is_in_flight(&run.run_id));
    let err = f.controller.step(&run.run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::RunBusy { .. }));
    let err = f.controller.abandon(&run.run_id).unwrap_err();
    assert!(matches!(err, PipelineError::RunBusy { .. }));

    let cancelled = f.controller.cancel(&run.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(!cancelled.resumable);

    let outcome = stepping.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Cancelled {
            stage: Stage::Setup
        }
    );
    assert!(!f.controller.is_in_flight(&run.run_id));
    assert_eq!(
        f.controller.status(&run.run_id).unwrap().status,
        RunStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_and_abandon_idle_runs() {
    let f = fixture(TestHandler::passing(), PipelineConfig::default());
    let a = f.controller.start("T-1").unwrap();
    let b = f.controller.start("T-1").unwrap();
    assert_eq!(f.controller.list_runs().unwrap().len(), 2);

    let cancelled = f.controller.cancel(&a.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    let abandoned = f.controller.abandon(&b.run_id).unwrap();
    assert_eq!(abandoned.status, RunStatus::Abandoned);

    assert!(f.controller.list_runs().unwrap().is_empty());
    let err = f.controller.abandon(&a.run_id).unwrap_err();
    assert!(matches!(err, PipelineError::TerminalRun { .. }));
}

// ── Shared state directory ────────────────────────────────────────────

/// Controller over its own store handle on `root`, like a separate process
fn controller_on(root: &Path, handler: Arc<dyn StageHandler>) -> Arc<PipelineController> {
    let store = JsonStateStore::open(root).unwrap().shared();
    let config = PipelineConfig {
        lease_poll_ms: 10,
        ..PipelineConfig::default()
    };
    Arc::new(PipelineController::new(
        config,
        store.clone(),
        store,
        handler,
        AdaptiveFeedbackIntegrator::new(Arc::new(MemoryKnowledgeBase::new())),
        Arc::new(StaticTicketSource::new().with_ticket("T-1", TICKET)),
    ))
}

#[tokio::test]
async fn test_second_controller_cannot_step_leased_run() {
    let dir = tempdir().unwrap();
    let parked = Arc::new(ParkedHandler {
        entered: Notify::new(),
    });
    let other_handler = TestHandler::passing();
    let first = controller_on(dir.path(), parked.clone());
    let second = controller_on(dir.path(), other_handler.clone());
    let run = first.start("T-1").unwrap();

    let stepping = {
        let first = first.clone();
        let run_id = run.run_id.clone();
        tokio::spawn(async move { first.advance(&run_id).await })
    };
    parked.entered.notified().await;

    assert!(!second.is_in_flight(&run.run_id));
    let err = second.step(&run.run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::RunBusy { .. }));
    let err = second.advance(&run.run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::RunBusy { .. }));
    let err = second.retry(&run.run_id).unwrap_err();
    assert!(matches!(err, PipelineError::RunBusy { .. }));
    assert_eq!(other_handler.calls(Stage::Setup), 0);

    // Cancel from the other controller abandons the parked oracle call
    let cancelled = tokio::time::timeout(Duration::from_secs(10), second.cancel(&run.run_id))
        .await
        .expect("cancel should not hang")
        .unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let outcome = stepping.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Cancelled {
            stage: Stage::Setup
        }
    );
    let runs_dir = dir.path().join("runs");
    assert!(!runs_dir.join(format!("{}.lease", run.run_id)).exists());
    assert!(!runs_dir.join(format!("{}.cancel", run.run_id)).exists());
}

#[tokio::test]
async fn test_lease_passes_between_controllers() {
    let dir = tempdir().unwrap();
    let first = controller_on(dir.path(), TestHandler::passing());
    let second = controller_on(dir.path(), TestHandler::passing());
    let run = first.start("T-1").unwrap();

    let outcome = first.step(&run.run_id).await.unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Advanced {
            from: Stage::Setup,
            to: Stage::RepoAccess
        }
    );
    let outcome = second.step(&run.run_id).await.unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Advanced {
            from: Stage::RepoAccess,
            to: Stage::Analysis
        }
    );
}

#[tokio::test]
async fn test_leftover_cancel_request_does_not_cancel_next_step() {
    let dir = tempdir().unwrap();
    let controller = controller_on(dir.path(), TestHandler::passing());
    let run = controller.start("T-1").unwrap();

    // Left behind by a canceller that died before claiming the run
    JsonStateStore::open(dir.path())
        .unwrap()
        .request_cancel(&run.run_id)
        .unwrap();

    let outcome = controller.step(&run.run_id).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Advanced { .. }));
    assert_eq!(
        controller.status(&run.run_id).unwrap().status,
        RunStatus::Active
    );
}

// ── Audit trail ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_audit_trail_records_transitions() {
    let dir = tempdir().unwrap();
    let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
    let store = MemoryStateStore::new().shared();
    let controller = PipelineController::new(
        PipelineConfig::default(),
        store.clone(),
        store,
        TestHandler::new(|stage, nth| match (stage, nth) {
            (Stage::Setup, 1) => Verdict::SoftFailAdapt,
            _ => Verdict::Pass,
        }),
        AdaptiveFeedbackIntegrator::new(Arc::new(MemoryKnowledgeBase::new())),
        Arc::new(StaticTicketSource::new().with_ticket("T-1", TICKET)),
    )
    .with_audit(audit);

    let run = controller.start("T-1").unwrap();
    controller.advance(&run.run_id).await.unwrap();
    controller.cancel(&run.run_id).await.unwrap();

    let events: Vec<AuditEvent> = controller
        .history(&run.run_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::RunStarted,
            AuditEvent::StageAdapting,
            AuditEvent::StagePassed,
            AuditEvent::RunCancelled,
        ]
    );
}

// ── With the production handler ───────────────────────────────────────

#[tokio::test]
async fn test_oracle_handler_learns_from_missing_feature() {
    let missing = "Error: routes.route.openshift.io not found\nCRD missing for route";
    let oracle = Arc::new(
        ScriptedOracle::new(vec![
            Ok(GOOD_PLAN.into()),
            Ok(GOOD_PLAN.into()),
            Ok(missing.into()),
        ])
        .with_fallback(Ok(GOOD_PLAN.into())),
    );
    let config = PipelineConfig::default();
    let handler =
        OracleStageHandler::from_config(&config, oracle.clone(), Taxonomy::default(), None)
            .unwrap();
    let f = fixture(Arc::new(handler), config);
    let run = f.controller.start("T-1").unwrap();

    drive_to_review(&f.controller, &run.run_id).await;

    assert_eq!(oracle.calls(), 5);
    let prompts = oracle.prompts();
    assert!(!prompts[2].contains("## Refinements"));
    assert!(prompts[3].contains("## Refinements"));
    assert!(prompts[3].contains("add explicit prerequisite check for routes.route.openshift.io"));

    let state = f.controller.status(&run.run_id).unwrap();
    assert_eq!(state.attempts_at(Stage::Analysis), 1);
    assert_eq!(state.artifact_refs[&Stage::Analysis].revision(), 2);
    assert_eq!(f.kb.list().unwrap()[0].check_name, FEATURE_AVAILABILITY);
}
