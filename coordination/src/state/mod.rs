//! State persistence for pipeline runs
//!
//! - Workflow state, one document per run, with an archive namespace for
//!   finished runs
//! - Immutable artifact blobs referenced by `ArtifactHandle`
//! - Run leases and cancel requests shared by every process on the store
//!
//! # Usage
//!
//! ```ignore
//! use plan_coordination::state::{JsonStateStore, RunStore};
//! use plan_coordination::pipeline::WorkflowState;
//!
//! let store = JsonStateStore::open("./plan-state")?;
//! let state = WorkflowState::new("PROJ-123");
//! store.save_run(&state)?;
//! ```

pub mod lease;
pub mod schema;
pub mod store;

pub use lease::{FileLease, DEFAULT_LEASE_TTL};
pub use store::{
    ArtifactStore, JsonStateStore, MemoryStateStore, RunLease, RunStore, SharedArtifactStore,
    SharedRunStore, StoreError, StoreResult,
};
