//! Pipeline error types
//!
//! Validation failures are not errors: they travel as [`ValidationVerdict`]s
//! inside [`StageOutcome`]s. The variants here cover what the controller
//! cannot express as a verdict: missing runs, illegal operator actions,
//! storage failures and internal-consistency violations.
//!
//! [`ValidationVerdict`]: crate::validation::ValidationVerdict
//! [`StageOutcome`]: crate::pipeline::StageOutcome

use crate::knowledge::KnowledgeError;
use crate::state::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================================================
// Structured Error Response (operator-facing)
// ============================================================================

/// Serializable error for `--json` CLI output.
///
/// # Example Response
/// ```json
/// {
///   "code": "RUN_NOT_FOUND",
///   "message": "Run not found: 0b5c...",
///   "recovery_action": "List live runs with `plan-runner runs`",
///   "context": { "run_id": "0b5c..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code (e.g., "RUN_NOT_FOUND", "CONSISTENCY")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Actionable recovery instruction for the operator
    pub recovery_action: String,

    /// Relevant context for debugging and recovery
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Whether this error is retryable (transient failure)
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Mark as retryable
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Errors that can occur while driving a run
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No live or archived state exists for the run
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run already reached a terminal status
    #[error("Run {run_id} is terminal ({status})")]
    TerminalRun { run_id: String, status: String },

    /// Another advance/step is already in flight for the run
    #[error("Run {run_id} is already being advanced")]
    RunBusy { run_id: String },

    /// Operator action not legal in the run's current state
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Request is malformed regardless of run state (e.g., modify without feedback)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Persisted state contradicts itself (e.g., a dangling artifact reference)
    #[error("Internal consistency violation: {message}")]
    Consistency { message: String },

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Run or artifact storage failed
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Knowledge base failed
    #[error("Knowledge base error: {0}")]
    Knowledge(#[from] KnowledgeError),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::RunNotFound {
            run_id: run_id.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Machine-readable code used in structured output
    pub fn code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::TerminalRun { .. } => "RUN_TERMINAL",
            Self::RunBusy { .. } => "RUN_BUSY",
            Self::InvalidStateTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::Consistency { .. } => "CONSISTENCY",
            Self::Config { .. } => "CONFIG",
            Self::Store(_) => "STORE",
            Self::Knowledge(_) => "KNOWLEDGE",
            Self::Io(_) => "IO",
            Self::Json(_) => "JSON",
        }
    }

    /// Check if this error is retryable (transient failure).
    ///
    /// Consistency violations are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RunBusy { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Store(e) => e.is_retryable(),
            Self::Knowledge(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "List live runs with `plan-runner runs`.",
            Self::TerminalRun { .. } => {
                "The run is finished. Start a new run for the ticket with `plan-runner start`."
            }
            Self::RunBusy { .. } => {
                "Another process is advancing this run. Poll `plan-runner status` and retry."
            }
            Self::InvalidStateTransition { .. } => {
                "Check the run's stage and status with `plan-runner status` before acting."
            }
            Self::InvalidRequest { .. } => "Fix the command arguments and try again.",
            Self::Consistency { .. } => {
                "Persisted state is corrupt. Inspect the run directory and audit trail; \
                 abandon the run and start a new one if it cannot be repaired."
            }
            Self::Config { .. } => {
                "Check the config file and PIPELINE_*/PLAN_* environment variables."
            }
            Self::Store(_) | Self::Io(_) => {
                "Check that the state directory exists, is writable and has free space."
            }
            Self::Knowledge(_) => "Check the knowledge base directory and retry.",
            Self::Json(_) => "A persisted document is not valid JSON. Restore or remove it.",
        }
    }

    /// Convert into the serializable operator-facing form
    pub fn to_structured(&self) -> StructuredError {
        let mut structured =
            StructuredError::new(self.code(), self.to_string(), self.recovery_suggestion());
        match self {
            Self::RunNotFound { run_id } | Self::RunBusy { run_id } => {
                structured = structured.with_context("run_id", run_id.clone());
            }
            Self::TerminalRun { run_id, status } => {
                structured = structured
                    .with_context("run_id", run_id.clone())
                    .with_context("status", status.clone());
            }
            _ => {}
        }
        if self.is_retryable() {
            structured = structured.retryable();
        }
        structured
    }
}
