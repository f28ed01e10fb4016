//! Namespace layout for the JSON-directory store
//!
//! Each namespace is a subdirectory of the state root:
//!
//! ```text
//! <root>/runs/<run_id>.json        live WorkflowState
//! <root>/runs/<run_id>.lease       held while a process works on the run
//! <root>/runs/<run_id>.cancel      cancel request for the lease holder
//! <root>/archive/<run_id>.json     terminal or abandoned WorkflowState
//! <root>/artifacts/<run_id>/...    artifact blobs, one file per handle
//! <root>/knowledge/<sig>.json      LearnedPattern per signature
//! <root>/knowledge/<sig>.lock      held during one upsert
//! <root>/audit.jsonl               append-only transition log
//! ```

/// Namespace for live runs
pub const NS_RUNS: &str = "runs";

/// Namespace for archived runs
pub const NS_ARCHIVE: &str = "archive";

/// Namespace for artifact blobs
pub const NS_ARTIFACTS: &str = "artifacts";

/// Namespace for the knowledge base
pub const NS_KNOWLEDGE: &str = "knowledge";

/// Audit trail file name
pub const AUDIT_FILE: &str = "audit.jsonl";

/// All directory namespaces
pub const ALL_NAMESPACES: &[&str] = &[NS_RUNS, NS_ARCHIVE, NS_ARTIFACTS, NS_KNOWLEDGE];

/// File names within namespaces
pub mod keys {
    use crate::pipeline::ArtifactHandle;

    /// State document of a run
    pub fn run(run_id: &str) -> String {
        format!("{run_id}.json")
    }

    /// Lease of a run
    pub fn run_lease(run_id: &str) -> String {
        format!("{run_id}.lease")
    }

    /// Cancel request marker of a run
    pub fn run_cancel(run_id: &str) -> String {
        format!("{run_id}.cancel")
    }

    /// Blob of an artifact, relative to the run's artifact directory
    pub fn artifact(handle: &ArtifactHandle) -> String {
        format!("{}.txt", handle.key())
    }

    /// Reject keys that would escape their namespace
    pub fn is_safe(key: &str) -> bool {
        !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\', '\0'])
            && !key.starts_with('.')
    }
}
