//! Failure feedback
//!
//! - [`signature`]: stable identity of a failure across runs
//! - [`integrator`]: failures in, refined context out
//!
//! ```text
//! Verdict (soft fail) → Signature → KnowledgeBase (upsert) → ContextDelta → next attempt
//! ```

pub mod integrator;
pub mod signature;

pub use integrator::{synthesize_solution, AdaptiveFeedbackIntegrator};
pub use signature::{normalize_message, Signature};
