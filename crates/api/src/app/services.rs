use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use commitpulse_infra::config::JobSystemConfig;
use commitpulse_infra::external::GithubDiffClient;
use commitpulse_infra::jobs::{InMemoryJobStore, JobQueue, JobStore, JobSystem, PostgresJobStore};
use commitpulse_infra::pipeline::{
    AdmissionGate, CommitPipeline, CommitStore, CreditLedger, DiffProvider,
    DiffStatSummaryGenerator, DigestScheduler, EmailSender, InMemoryCommitStore,
    InMemoryCreditLedger, LogEmailSender, SummaryGenerator, pipeline_handlers,
};

/// Upstream systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn CreditLedger>,
    pub diffs: Arc<dyn DiffProvider>,
    pub summaries: Arc<dyn SummaryGenerator>,
    pub emails: Arc<dyn EmailSender>,
    pub commits: Arc<dyn CommitStore>,
}

impl Collaborators {
    /// GitHub for diffs, everything else in-process.
    pub fn dev(config: &JobSystemConfig) -> Self {
        if config.github_token.is_none() {
            warn!("GITHUB_TOKEN not set; diff fetches use the unauthenticated rate limit");
        }

        Self {
            ledger: Arc::new(InMemoryCreditLedger::with_default_balance(
                config.dev_credit_balance,
            )),
            diffs: Arc::new(GithubDiffClient::new(config.github_token.clone())),
            summaries: Arc::new(DiffStatSummaryGenerator),
            emails: Arc::new(LogEmailSender),
            commits: Arc::new(InMemoryCommitStore::new()),
        }
    }
}

pub struct AppServices {
    pub config: JobSystemConfig,
    pub queue: JobQueue,
    pub pipeline: CommitPipeline,
    pub digests: DigestScheduler,
    pub system: JobSystem,
}

impl AppServices {
    pub fn new(config: JobSystemConfig, store: Arc<dyn JobStore>, collaborators: Collaborators) -> Self {
        let queue = JobQueue::new(store).with_default_max_attempts(config.default_max_attempts);

        let handlers = pipeline_handlers(
            collaborators.diffs,
            collaborators.summaries,
            collaborators.emails,
            collaborators.commits.clone(),
        );

        let admission = AdmissionGate::new(
            collaborators.ledger,
            config.summary_credit_cost,
            config.billing_url.clone(),
        );

        Self {
            pipeline: CommitPipeline::new(queue.clone(), admission, collaborators.commits.clone()),
            digests: DigestScheduler::new(queue.clone(), collaborators.commits),
            system: JobSystem::new(queue.clone(), handlers, config.clone()),
            queue,
            config,
        }
    }

    /// In-memory job store with the given collaborators (dev/test).
    pub fn in_memory(config: JobSystemConfig, collaborators: Collaborators) -> Self {
        Self::new(config, Arc::new(InMemoryJobStore::new()), collaborators)
    }
}

/// Wire services from configuration: Postgres when `database_url` is set,
/// in-memory otherwise.
pub async fn build_services(config: JobSystemConfig) -> anyhow::Result<AppServices> {
    let collaborators = Collaborators::dev(&config);

    let Some(url) = config.database_url.clone() else {
        info!("using in-memory job store");
        return Ok(AppServices::in_memory(config, collaborators));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to create job tables")?;

    info!("using Postgres job store");
    Ok(AppServices::new(config, Arc::new(store), collaborators))
}
