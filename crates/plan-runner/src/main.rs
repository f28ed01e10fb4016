//! `plan-runner`: drive ticket-to-test-plan runs from the shell
//!
//! Exit codes: 0 = passed/advanced, 1 = hard failure, 2 = in progress
//! (adapting or awaiting human review; poll `status`).
//!
//! ```bash
//! PLAN_ORACLE_URL=http://localhost:8080/v1 plan-runner start PROJ-123 --run
//! plan-runner resume <run-id> modify --feedback "add RBAC check"
//! plan-runner status <run-id> --json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use plan_coordination::pipeline::{HaltReport, StageOutcome, WorkflowState};
use plan_coordination::{PipelineError, ReviewDecision, ValidationResult};
use plan_runner::{ConfigArgs, RunnerConfig, Runtime};
use serde::Serialize;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "plan-runner", version, about = "Ticket-to-test-plan pipeline runner")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print machine-readable JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a run for a ticket
    Start {
        ticket: String,
        /// Keep advancing until the run stops making automatic progress
        #[arg(long, default_value_t = false)]
        run: bool,
    },
    /// Run the current stage, adapting inline until it passes or halts
    Advance { run_id: String },
    /// Run the current stage exactly once
    Step { run_id: String },
    /// Apply a human review decision
    Resume {
        run_id: String,
        #[arg(value_enum)]
        decision: DecisionArg,
        /// Operator feedback (required for modify)
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Show a run
    Status { run_id: String },
    /// Cancel a run, interrupting an in-flight stage
    Cancel { run_id: String },
    /// Abandon an idle run
    Abandon { run_id: String },
    /// Clear a halt and make the stage runnable again
    Retry { run_id: String },
    /// List runs
    Runs,
    /// Show a run's audit trail
    History { run_id: String },
    /// Inspect the knowledge base
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KbCommand {
    /// List learned patterns, most confident first
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DecisionArg {
    Approve,
    Reject,
    Modify,
}

impl From<DecisionArg> for ReviewDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Self::Approve,
            DecisionArg::Reject => Self::Reject,
            DecisionArg::Modify => Self::Modify,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plan_runner=info,plan_coordination=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            report_error(&err, json);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = RunnerConfig::resolve(&cli.config);
    let runtime = Runtime::build(&config)?;
    let controller = runtime.controller.clone();
    let json = cli.json;

    match cli.command {
        Command::Start { ticket, run } => {
            let state = controller.start(&ticket)?;
            if !run {
                emit(json, &state, || {
                    format!("started run {} for ticket {}", state.run_id, state.ticket_id)
                })?;
                return Ok(0);
            }
            eprintln!("run {}", state.run_id);
            loop {
                let outcome = advance_or_cancel(&runtime, &state.run_id).await?;
                print_outcome(json, &outcome)?;
                if !matches!(outcome, StageOutcome::Advanced { .. }) {
                    return Ok(exit_code(&outcome));
                }
            }
        }
        Command::Advance { run_id } => {
            let outcome = advance_or_cancel(&runtime, &run_id).await?;
            print_outcome(json, &outcome)?;
            Ok(exit_code(&outcome))
        }
        Command::Step { run_id } => {
            let outcome = controller.step(&run_id).await?;
            print_outcome(json, &outcome)?;
            Ok(exit_code(&outcome))
        }
        Command::Resume {
            run_id,
            decision,
            feedback,
        } => {
            let outcome = controller
                .resume(&run_id, decision.into(), feedback.as_deref())
                .await?;
            print_outcome(json, &outcome)?;
            Ok(exit_code(&outcome))
        }
        Command::Status { run_id } => {
            let state = controller.status(&run_id)?;
            emit(json, &state, || format_state(&state))?;
            Ok(0)
        }
        Command::Cancel { run_id } => {
            let state = controller.cancel(&run_id).await?;
            emit(json, &state, || format!("run {} {}", state.run_id, state.status))?;
            Ok(0)
        }
        Command::Abandon { run_id } => {
            let state = controller.abandon(&run_id)?;
            emit(json, &state, || format!("run {} {}", state.run_id, state.status))?;
            Ok(0)
        }
        Command::Retry { run_id } => {
            let state = controller.retry(&run_id)?;
            emit(json, &state, || {
                format!("run {} ready to retry {}", state.run_id, state.current_stage)
            })?;
            Ok(0)
        }
        Command::Runs => {
            let runs = controller.list_runs()?;
            emit(json, &runs, || {
                runs.iter()
                    .map(|s| {
                        format!(
                            "{}  {:<18} {:<16} {}",
                            s.run_id,
                            s.current_stage.to_string(),
                            s.status.to_string(),
                            s.ticket_id
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(0)
        }
        Command::History { run_id } => {
            let entries = controller.history(&run_id)?;
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| {
                        let mut line = format!(
                            "{}  {:?}",
                            e.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                            e.event
                        );
                        if let Some(stage) = e.stage {
                            line.push_str(&format!(" @ {stage}"));
                        }
                        if let Some(detail) = &e.detail {
                            line.push_str(&format!(" ({detail})"));
                        }
                        line
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(0)
        }
        Command::Kb {
            command: KbCommand::List,
        } => {
            let mut patterns = runtime.knowledge.list()?;
            patterns.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then_with(|| b.occurrences.cmp(&a.occurrences))
            });
            emit(json, &patterns, || {
                patterns
                    .iter()
                    .map(|p| {
                        format!(
                            "{}  conf={:.2} seen={}  [{}] {}\n    → {}",
                            p.signature,
                            p.confidence,
                            p.occurrences,
                            p.check_name,
                            p.symptom,
                            p.solution_delta
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(0)
        }
    }
}

/// `advance`, turning Ctrl-C into a cancellation of the run
async fn advance_or_cancel(runtime: &Runtime, run_id: &str) -> Result<StageOutcome> {
    let controller = runtime.controller.clone();
    tokio::select! {
        outcome = controller.advance(run_id) => Ok(outcome?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, cancelling run {run_id}");
            let state = runtime.controller.cancel(run_id).await?;
            Ok(StageOutcome::Cancelled { stage: state.current_stage })
        }
    }
}

fn exit_code(outcome: &StageOutcome) -> u8 {
    u8::try_from(outcome.exit_code()).unwrap_or(1)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        let text = text();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(())
}

fn print_outcome(json: bool, outcome: &StageOutcome) -> Result<()> {
    emit(json, outcome, || match outcome {
        StageOutcome::Halted { results, .. } => {
            format!("{outcome}{}", format_results(results))
        }
        _ => outcome.to_string(),
    })
}

fn format_halt(halt: &HaltReport) -> String {
    format!(
        "halted at {}{}: {}{}",
        halt.stage,
        if halt.escalated { " (escalated)" } else { "" },
        halt.reason,
        format_results(&halt.results)
    )
}

/// One indented line per result; `!` marks critical checks
fn format_results(results: &[ValidationResult]) -> String {
    results
        .iter()
        .map(|r| {
            format!(
                "\n  [{}]{} {}: {}",
                r.status,
                if r.critical { "!" } else { " " },
                r.check_name,
                r.message
            )
        })
        .collect()
}

fn format_state(state: &WorkflowState) -> String {
    let mut lines = vec![
        format!("run      {}", state.run_id),
        format!("ticket   {}", state.ticket_id),
        format!("stage    {}", state.current_stage),
        format!("status   {}", state.status),
        format!("updated  {}", state.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    ];
    if !state.context_delta.is_empty() {
        lines.push(format!("refinements {}", state.context_delta.len()));
    }
    if let Some(halt) = &state.halt {
        lines.push(format_halt(halt));
    }
    if !state.stage_history.is_empty() {
        lines.push("history:".to_string());
        for record in &state.stage_history {
            let mut line = format!(
                "  {:<18} {:<16} attempt {}",
                record.stage.to_string(),
                record.verdict.to_string(),
                record.attempt
            );
            if let Some(decision) = record.decision {
                line.push_str(&format!(" decision={decision}"));
            }
            if let Some(note) = &record.note {
                line.push_str(&format!(" ({note})"));
            }
            lines.push(line);
        }
    }
    lines.join("\n")
}

fn report_error(err: &anyhow::Error, json: bool) {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline_err) if json => {
            let structured = pipeline_err.to_structured();
            match serde_json::to_string_pretty(&structured) {
                Ok(text) => println!("{text}"),
                Err(_) => eprintln!("error: {err:#}"),
            }
        }
        Some(pipeline_err) => {
            eprintln!("error: {err:#}");
            eprintln!("hint: {}", pipeline_err.recovery_suggestion());
        }
        None => eprintln!("error: {err:#}"),
    }
}
