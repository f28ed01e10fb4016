//! Knowledge Base: learned (problem → solution) patterns keyed by signature
//!
//! Patterns are created on first observation and only ever updated:
//! occurrences grow by one per observation and confidence never decreases.
//! Writers are serialized per signature, never globally.
//!
//! # Modules
//!
//! - [`memory`]: sharded in-memory store
//! - [`file`]: one JSON document per signature on disk

pub mod file;
pub mod memory;

pub use file::FileKnowledgeBase;
pub use memory::MemoryKnowledgeBase;

use crate::feedback::Signature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Confidence assigned to a freshly synthesized pattern
pub const INITIAL_CONFIDENCE: f64 = 0.3;

/// A problem the pipeline has seen before and what helped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub signature: Signature,
    /// Check that reported the problem
    pub check_name: String,
    /// Normalized failure message
    pub symptom: String,
    /// Instruction merged into the context when the problem recurs
    pub solution_delta: String,
    /// In [0, 1]; non-decreasing across observations
    pub confidence: f64,
    /// At least 1
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl LearnedPattern {
    /// Pattern for a first observation
    pub fn first(signature: Signature, delta: &PatternDelta) -> Self {
        let now = Utc::now();
        Self {
            signature,
            check_name: delta.check_name.clone(),
            symptom: delta.symptom.clone(),
            solution_delta: delta.solution_delta.clone(),
            confidence: delta.initial_confidence.clamp(0.0, 1.0),
            occurrences: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Record a repeat observation.
    ///
    /// Confidence follows `1 - 1/(occurrences + 1)` but never drops below
    /// its previous value and never exceeds 1.0.
    pub fn observe(&mut self) {
        self.occurrences = self.occurrences.saturating_add(1);
        let target = 1.0 - 1.0 / (f64::from(self.occurrences) + 1.0);
        self.confidence = self.confidence.max(target).min(1.0);
        self.last_seen = Utc::now();
    }
}

/// What to store when a signature is observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDelta {
    pub check_name: String,
    pub symptom: String,
    /// Used only when the signature is new
    pub solution_delta: String,
    pub initial_confidence: f64,
}

impl PatternDelta {
    pub fn new(
        check_name: impl Into<String>,
        symptom: impl Into<String>,
        solution_delta: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            symptom: symptom.into(),
            solution_delta: solution_delta.into(),
            initial_confidence: INITIAL_CONFIDENCE,
        }
    }
}

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt pattern {signature}: {message}")]
    Corrupt { signature: String, message: String },

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl KnowledgeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type KnowledgeResult<T> = Result<T, KnowledgeError>;

/// Queryable, update-only pattern store shared by all runs
pub trait KnowledgeStore: Send + Sync {
    fn get(&self, signature: &Signature) -> KnowledgeResult<Option<LearnedPattern>>;

    /// Insert on first observation, otherwise record a repeat.
    /// Returns the pattern as stored after the update.
    fn upsert(&self, signature: &Signature, delta: &PatternDelta)
        -> KnowledgeResult<LearnedPattern>;

    /// All patterns, highest confidence first
    fn list(&self) -> KnowledgeResult<Vec<LearnedPattern>>;
}

/// Shared reference to a knowledge store
pub type SharedKnowledgeStore = Arc<dyn KnowledgeStore>;

pub(crate) fn sort_for_listing(patterns: &mut [LearnedPattern]) {
    patterns.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.signature.cmp(&b.signature))
    });
}
