//! Context deltas: additive refinements carried across retries
//!
//! A delta only grows. Merging a refinement whose key is already present
//! keeps a single entry for the key: the more confident of the two wins,
//! so confidence never drops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key prefix of operator-supplied refinements
pub const OPERATOR_KEY_PREFIX: &str = "operator:";

/// Where a refinement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementSource {
    /// Known pattern from the knowledge base
    Learned,
    /// Freshly synthesized for an unseen failure
    Synthesized,
    /// Human review feedback
    Operator,
}

/// One instruction added to the generation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    /// Signature of the failure, or `operator:<n>`
    pub key: String,
    pub instruction: String,
    pub source: RefinementSource,
    pub confidence: f64,
    pub added_at: DateTime<Utc>,
}

impl Refinement {
    pub fn new(
        key: impl Into<String>,
        instruction: impl Into<String>,
        source: RefinementSource,
        confidence: f64,
    ) -> Self {
        Self {
            key: key.into(),
            instruction: instruction.into(),
            source,
            confidence: confidence.clamp(0.0, 1.0),
            added_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    refinements: Vec<Refinement>,
}

impl ContextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.refinements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refinements.is_empty()
    }

    /// Refinements in insertion order
    pub fn refinements(&self) -> &[Refinement] {
        &self.refinements
    }

    pub fn get(&self, key: &str) -> Option<&Refinement> {
        self.refinements.iter().find(|r| r.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Add a refinement. Returns true when the key was new.
    ///
    /// An existing key takes the instruction and source of the incoming
    /// refinement when it is at least as confident; `added_at` is kept.
    pub fn add(&mut self, refinement: Refinement) -> bool {
        match self.refinements.iter_mut().find(|r| r.key == refinement.key) {
            Some(existing) => {
                if refinement.confidence >= existing.confidence {
                    existing.instruction = refinement.instruction;
                    existing.source = refinement.source;
                    existing.confidence = refinement.confidence;
                }
                false
            }
            None => {
                self.refinements.push(refinement);
                true
            }
        }
    }

    /// Merge every refinement of `other` into `self`
    pub fn merge(&mut self, other: &ContextDelta) {
        for refinement in &other.refinements {
            self.add(refinement.clone());
        }
    }

    /// Append operator feedback under the next `operator:<n>` key.
    /// Returns the key used.
    pub fn add_operator_feedback(&mut self, feedback: &str) -> String {
        let n = self
            .refinements
            .iter()
            .filter(|r| r.source == RefinementSource::Operator)
            .count()
            + 1;
        let key = format!("{OPERATOR_KEY_PREFIX}{n}");
        self.add(Refinement::new(
            key.clone(),
            feedback.trim(),
            RefinementSource::Operator,
            1.0,
        ));
        key
    }

    /// Refinements in prompt order: operator feedback first (oldest first),
    /// then the rest by descending confidence.
    pub fn ordered(&self) -> Vec<&Refinement> {
        let mut operator: Vec<&Refinement> = self
            .refinements
            .iter()
            .filter(|r| r.source == RefinementSource::Operator)
            .collect();
        let mut learned: Vec<&Refinement> = self
            .refinements
            .iter()
            .filter(|r| r.source != RefinementSource::Operator)
            .collect();
        learned.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        operator.append(&mut learned);
        operator
    }

    /// Bullet list for the prompt; empty string when there is nothing to say
    pub fn render(&self) -> String {
        self.ordered()
            .iter()
            .map(|r| match r.source {
                RefinementSource::Operator => format!("- [operator] {}", r.instruction),
                _ => format!("- {} (confidence {:.2})", r.instruction, r.confidence),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
