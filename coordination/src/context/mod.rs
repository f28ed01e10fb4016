//! Context: everything that goes into an oracle prompt
//!
//! - [`assembler`]: keyword extraction, taxonomy matching, prompt rendering
//! - [`delta`]: additive refinements accumulated across retries
//! - [`taxonomy`]: component/action vocabulary

pub mod assembler;
pub mod delta;
pub mod taxonomy;

pub use assembler::{
    extract_keywords, rank_excerpts, AssembledContext, AssemblerConfig, ContextAssembler,
    StageInputs,
};
pub use delta::{ContextDelta, Refinement, RefinementSource, OPERATOR_KEY_PREFIX};
pub use taxonomy::{Component, ComponentMatch, Taxonomy};
