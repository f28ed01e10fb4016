//! Runner configuration
//!
//! Every setting comes from a `PLAN_*` environment variable with a default;
//! command-line flags take precedence over the environment.

use clap::Args;
use std::path::PathBuf;

pub const DEFAULT_ORACLE_URL: &str = "http://localhost:8080/v1";
pub const DEFAULT_ORACLE_MODEL: &str = "default";
pub const DEFAULT_STATE_DIR: &str = ".plan-state";
pub const DEFAULT_TICKET_DIR: &str = "tickets";

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct OracleEndpoint {
    /// Base URL (`.../v1`) or the full `.../chat/completions` URL
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// HTTP request timeout
    pub timeout_secs: u64,
}

impl Default for OracleEndpoint {
    fn default() -> Self {
        Self {
            url: DEFAULT_ORACLE_URL.to_string(),
            model: DEFAULT_ORACLE_MODEL.to_string(),
            api_key: None,
            max_tokens: 4096,
            temperature: 0.2,
            timeout_secs: 300,
        }
    }
}

/// Global flags shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Oracle base URL (overrides PLAN_ORACLE_URL)
    #[arg(long, global = true)]
    pub oracle_url: Option<String>,

    /// Oracle model name (overrides PLAN_ORACLE_MODEL)
    #[arg(long, global = true)]
    pub oracle_model: Option<String>,

    /// Directory for runs, artifacts, knowledge and audit (overrides PLAN_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory of `<id>.md` / `<id>.txt` tickets (overrides PLAN_TICKET_DIR)
    #[arg(long, global = true)]
    pub ticket_dir: Option<PathBuf>,

    /// Command printing a ticket, `{id}` is substituted (overrides PLAN_TICKET_COMMAND)
    #[arg(long, global = true)]
    pub ticket_command: Option<String>,

    /// Local checkout used for repository excerpts (overrides PLAN_REPO_DIR)
    #[arg(long, global = true)]
    pub repo_dir: Option<PathBuf>,

    /// Component taxonomy TOML (overrides PLAN_TAXONOMY_PATH)
    #[arg(long, global = true)]
    pub taxonomy: Option<PathBuf>,

    /// URL probed by the environment-readiness check (overrides PLAN_ENV_PROBE_URL)
    #[arg(long, global = true)]
    pub env_probe_url: Option<String>,

    /// Pipeline configuration TOML (overrides PLAN_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Where tickets come from
#[derive(Debug, Clone, PartialEq)]
pub enum TicketOrigin {
    Directory(PathBuf),
    Command(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub oracle: OracleEndpoint,
    pub state_dir: PathBuf,
    pub tickets: TicketOrigin,
    pub repo_dir: Option<PathBuf>,
    pub taxonomy_path: Option<PathBuf>,
    pub env_probe_url: Option<String>,
    /// Pipeline TOML; `None` means built-in defaults plus `PIPELINE_*` overrides
    pub pipeline_config: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            oracle: OracleEndpoint::default(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            tickets: TicketOrigin::Directory(PathBuf::from(DEFAULT_TICKET_DIR)),
            repo_dir: None,
            taxonomy_path: None,
            env_probe_url: None,
            pipeline_config: None,
        }
    }
}

impl RunnerConfig {
    /// Resolve from the process environment and `args`
    pub fn resolve(args: &ConfigArgs) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok()).with_args(args)
    }

    /// Read `PLAN_*` settings through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let tickets = match (get("PLAN_TICKET_COMMAND"), get("PLAN_TICKET_DIR")) {
            (Some(command), _) => TicketOrigin::Command(command),
            (None, Some(dir)) => TicketOrigin::Directory(PathBuf::from(dir)),
            (None, None) => defaults.tickets,
        };

        Self {
            oracle: OracleEndpoint {
                url: get("PLAN_ORACLE_URL").unwrap_or(defaults.oracle.url),
                model: get("PLAN_ORACLE_MODEL").unwrap_or(defaults.oracle.model),
                api_key: get("PLAN_ORACLE_API_KEY"),
                ..defaults.oracle
            },
            state_dir: get("PLAN_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            tickets,
            repo_dir: get("PLAN_REPO_DIR").map(PathBuf::from),
            taxonomy_path: get("PLAN_TAXONOMY_PATH").map(PathBuf::from),
            env_probe_url: get("PLAN_ENV_PROBE_URL"),
            pipeline_config: get("PLAN_CONFIG").map(PathBuf::from),
        }
    }

    /// Apply command-line flags on top
    pub fn with_args(mut self, args: &ConfigArgs) -> Self {
        if let Some(url) = &args.oracle_url {
            self.oracle.url = url.clone();
        }
        if let Some(model) = &args.oracle_model {
            self.oracle.model = model.clone();
        }
        if let Some(dir) = &args.state_dir {
            self.state_dir = dir.clone();
        }
        // An explicit command beats an explicit directory
        if let Some(dir) = &args.ticket_dir {
            self.tickets = TicketOrigin::Directory(dir.clone());
        }
        if let Some(command) = &args.ticket_command {
            self.tickets = TicketOrigin::Command(command.clone());
        }
        if let Some(dir) = &args.repo_dir {
            self.repo_dir = Some(dir.clone());
        }
        if let Some(path) = &args.taxonomy {
            self.taxonomy_path = Some(path.clone());
        }
        if let Some(url) = &args.env_probe_url {
            self.env_probe_url = Some(url.clone());
        }
        if let Some(path) = &args.config {
            self.pipeline_config = Some(path.clone());
        }
        self
    }
}
