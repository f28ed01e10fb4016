//! Wiring: runner configuration → pipeline controller

use crate::config::{RunnerConfig, TicketOrigin};
use crate::oracle_client::HttpOracle;
use crate::probe::HttpEnvironmentProbe;
use crate::repo_source::DirectoryRepositorySource;
use crate::ticket_source::{CommandTicketSource, FileTicketSource};
use anyhow::{Context, Result};
use plan_coordination::context::Taxonomy;
use plan_coordination::sources::SharedTicketSource;
use plan_coordination::state::schema::{AUDIT_FILE, NS_KNOWLEDGE};
use plan_coordination::validation::EnvironmentProbe;
use plan_coordination::{
    AdaptiveFeedbackIntegrator, AuditLog, FileKnowledgeBase, JsonStateStore, OracleStageHandler,
    PipelineConfig, PipelineController, SharedKnowledgeStore, SharedOracle,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a CLI invocation needs
pub struct Runtime {
    pub controller: Arc<PipelineController>,
    pub knowledge: SharedKnowledgeStore,
}

impl Runtime {
    /// Runtime talking to the configured HTTP oracle
    pub fn build(config: &RunnerConfig) -> Result<Self> {
        let oracle = HttpOracle::new(&config.oracle).context("Failed to build oracle client")?;
        Self::with_oracle(config, Arc::new(oracle))
    }

    /// Runtime with an injected oracle
    pub fn with_oracle(config: &RunnerConfig, oracle: SharedOracle) -> Result<Self> {
        let pipeline = PipelineConfig::load(config.pipeline_config.as_deref())
            .context("Failed to load pipeline configuration")?;

        let store = JsonStateStore::open(&config.state_dir)
            .with_context(|| format!("Failed to open state dir {}", config.state_dir.display()))?
            .shared();
        let knowledge: SharedKnowledgeStore = Arc::new(
            FileKnowledgeBase::open(config.state_dir.join(NS_KNOWLEDGE))
                .context("Failed to open knowledge base")?,
        );
        let audit = Arc::new(AuditLog::new(config.state_dir.join(AUDIT_FILE)));

        let taxonomy = match &config.taxonomy_path {
            Some(path) => Taxonomy::from_file(path)
                .with_context(|| format!("Failed to load taxonomy {}", path.display()))?,
            None => Taxonomy::default(),
        };
        let probe = match &config.env_probe_url {
            Some(url) => Some(Arc::new(
                HttpEnvironmentProbe::new(url.clone(), PROBE_TIMEOUT)
                    .context("Failed to build environment probe")?,
            ) as Arc<dyn EnvironmentProbe>),
            None => None,
        };
        let handler = OracleStageHandler::from_config(&pipeline, oracle, taxonomy, probe)
            .context("Invalid pipeline configuration")?;

        let tickets: SharedTicketSource = match &config.tickets {
            TicketOrigin::Directory(dir) => Arc::new(FileTicketSource::new(dir.clone())),
            TicketOrigin::Command(template) => Arc::new(
                CommandTicketSource::new(template).context("Invalid ticket command")?,
            ),
        };

        let mut controller = PipelineController::new(
            pipeline,
            store.clone(),
            store,
            Arc::new(handler),
            AdaptiveFeedbackIntegrator::new(knowledge.clone()),
            tickets,
        )
        .with_audit(audit);
        if let Some(dir) = &config.repo_dir {
            controller =
                controller.with_repository(Arc::new(DirectoryRepositorySource::new(dir.clone())));
        }

        info!(
            state_dir = %config.state_dir.display(),
            oracle = %config.oracle.url,
            model = %config.oracle.model,
            repository = config.repo_dir.is_some(),
            "Runtime ready"
        );

        Ok(Self {
            controller: Arc::new(controller),
            knowledge,
        })
    }
}
