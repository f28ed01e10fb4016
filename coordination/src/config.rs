//! Pipeline configuration
//!
//! Defaults, then an optional TOML file, then `PIPELINE_*` environment
//! variables. Later layers win.

use crate::context::AssemblerConfig;
use crate::error::PipelineError;
use crate::normalizer::NormalizerConfig;
use crate::oracle::RetryPolicy;
use crate::validation::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::config(err.to_string())
    }
}

/// What happens when a run reaches the Implementation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationPolicy {
    /// Record a no-op pass marked "deferred" and end the run
    #[default]
    Deferred,
    /// Run Implementation and QualityValidation like any other stage
    Execute,
}

impl FromStr for ImplementationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deferred" | "defer" => Ok(Self::Deferred),
            "execute" => Ok(Self::Execute),
            other => Err(ConfigError::InvalidValue {
                key: "implementation_policy".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Refinement attempts per stage before a soft failure is escalated
    pub retry_ceiling: u32,
    pub implementation_policy: ImplementationPolicy,
    /// Oracle transport retries
    pub oracle_retry: RetryPolicy,
    /// Upper bound on a single oracle call, in seconds
    pub oracle_call_timeout_secs: u64,
    /// How often a step refreshes its run lease and looks for cancel requests
    pub lease_poll_ms: u64,
    pub normalizer: NormalizerConfig,
    pub validation: ValidationConfig,
    pub assembler: AssemblerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            implementation_policy: ImplementationPolicy::default(),
            oracle_retry: RetryPolicy::default(),
            oracle_call_timeout_secs: 300,
            lease_poll_ms: 250,
            normalizer: NormalizerConfig::default(),
            validation: ValidationConfig::default(),
            assembler: AssemblerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults (or `path`, when given) with environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `PIPELINE_*` overrides read through `lookup`.
    ///
    /// Taking the lookup as a closure keeps this testable without touching
    /// the process environment.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("PIPELINE_RETRY_CEILING") {
            self.retry_ceiling = parse_env("PIPELINE_RETRY_CEILING", &v)?;
        }
        if let Some(v) = lookup("PIPELINE_MAX_TABLE_ROWS") {
            self.normalizer.max_rows = parse_env("PIPELINE_MAX_TABLE_ROWS", &v)?;
        }
        if let Some(v) = lookup("PIPELINE_CHECK_TIMEOUT_SECS") {
            self.validation.check_timeout_secs = parse_env("PIPELINE_CHECK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PIPELINE_STAGE_TIMEOUT_SECS") {
            self.validation.stage_timeout_secs = parse_env("PIPELINE_STAGE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PIPELINE_ORACLE_MAX_RETRIES") {
            self.oracle_retry.max_retries = parse_env("PIPELINE_ORACLE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PIPELINE_IMPLEMENTATION_POLICY") {
            self.implementation_policy = v.parse()?;
        }
        if let Some(v) = lookup("PIPELINE_SOFT_FAIL_THRESHOLD") {
            self.validation.reduction.soft_fail_threshold =
                parse_env("PIPELINE_SOFT_FAIL_THRESHOLD", &v)?;
        }
        Ok(self)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
