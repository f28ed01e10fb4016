//! Plan Runner
//!
//! Concrete I/O for the pipeline controller and the `plan-runner` CLI:
//!
//! - [`config`]: runner settings from `PLAN_*` variables and flags
//! - [`oracle_client`]: OpenAI-compatible chat completions oracle
//! - [`ticket_source`]: tickets from a directory or a command
//! - [`repo_source`]: keyword-ranked excerpts from a local checkout
//! - [`probe`]: HTTP reachability probe for the target environment
//! - [`runtime`]: wires everything into a [`PipelineController`]
//!
//! [`PipelineController`]: plan_coordination::PipelineController

pub mod config;
pub mod oracle_client;
pub mod probe;
pub mod repo_source;
pub mod runtime;
pub mod ticket_source;

pub use config::{ConfigArgs, OracleEndpoint, RunnerConfig, TicketOrigin};
pub use oracle_client::HttpOracle;
pub use probe::HttpEnvironmentProbe;
pub use repo_source::DirectoryRepositorySource;
pub use runtime::Runtime;
pub use ticket_source::{CommandTicketSource, FileTicketSource};
