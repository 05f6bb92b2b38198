//! Component wiring.
//!
//! [`App::new`] builds every pipeline component once from an explicit
//! [`Config`], a [`Store`], and the external [`Services`]. The CLI passes
//! the SQLite store and real clients; tests pass the in-memory store and
//! scripted fakes.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::error;

use repo_compare_core::category::CategoryResolver;
use repo_compare_core::embedding::EmbeddingService;
use repo_compare_core::models::OperationStatus;
use repo_compare_core::store::Store;

use crate::aggregator::SourceAggregator;
use crate::analyzer::RepositoryAnalyzer;
use crate::completion::{create_completion_service, TextCompletionService};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::interpreter::QueryInterpreter;
use crate::jobs::{DeepAnalysisJobs, JobOutcome, JobRunner, QueuedJob, WorkerPool};
use crate::ledger::{BudgetGate, CostLedger};
use crate::pipeline::ComparisonPipeline;
use crate::progress::{ProgressHub, ProgressReporter};
use crate::ranker::ComparisonRanker;
use crate::search_source::{GitHubSearch, SourceSearch};

/// External collaborators.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn SourceSearch>,
    pub completion: Arc<dyn TextCompletionService>,
    pub embedder: Option<Arc<dyn EmbeddingService>>,
}

impl Services {
    /// Real clients as configured. API keys are read here and nowhere else.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            source: Arc::new(GitHubSearch::new(&config.source)?),
            completion: create_completion_service(&config.llm)?,
            embedder: create_embedder(&config.embedding)?,
        })
    }
}

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub services: Services,
    pub hub: ProgressHub,
    pub ledger: CostLedger,
    pub gate: Arc<BudgetGate>,
    pub resolver: Arc<CategoryResolver>,
    pub analyzer: Arc<RepositoryAnalyzer>,
    pub pipeline: Arc<ComparisonPipeline>,
    pub deep_analysis: Arc<DeepAnalysisJobs>,
}

impl App {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, services: Services) -> Result<Self> {
        let model = config.llm.chat_model.clone();
        let ledger = CostLedger::new(store.clone());
        let gate = Arc::new(BudgetGate::new(store.clone(), config.budget.clone()));
        let resolver = Arc::new(CategoryResolver::new(
            store.clone(),
            services.embedder.clone(),
            config.categories.thresholds(),
        ));
        let analyzer = Arc::new(RepositoryAnalyzer::new(
            store.clone(),
            services.completion.clone(),
            services.source.clone(),
            resolver.clone(),
            ledger.clone(),
            model.clone(),
        ));

        let interpreter = QueryInterpreter::new(
            services.completion.clone(),
            model.clone(),
            config.llm.max_query_length,
        )?;
        let aggregator = SourceAggregator::new(
            store.clone(),
            services.source.clone(),
            analyzer.clone(),
            config.aggregator.clone(),
        );
        let ranker = ComparisonRanker::new(
            store.clone(),
            services.completion.clone(),
            resolver.clone(),
            ledger.clone(),
            model,
        )?;
        let pipeline = Arc::new(ComparisonPipeline::new(
            store.clone(),
            config.clone(),
            interpreter,
            aggregator,
            ranker,
            ledger.clone(),
            gate.clone(),
        ));
        let deep_analysis = Arc::new(DeepAnalysisJobs::new(
            store.clone(),
            analyzer.clone(),
            gate.clone(),
        ));

        Ok(Self {
            config,
            store,
            services,
            hub: ProgressHub::new(),
            ledger,
            gate,
            resolver,
            analyzer,
            pipeline,
            deep_analysis,
        })
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.store.clone(),
            self.gate.clone(),
            self.hub.clone(),
            &self.config.jobs,
            self.pipeline.clone(),
            self.deep_analysis.clone(),
        )
    }

    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(Arc::new(self.runner()), self.config.jobs.workers)
    }

    /// Run one job on a fresh worker pool while rendering its progress.
    ///
    /// A job that cannot be followed is failed before it is queued, so its
    /// reservation is released. A skipped job publishes no terminal event,
    /// so its topic is closed here to end the reporter.
    pub async fn run_reported(
        &self,
        job: QueuedJob,
        reporter: Box<dyn ProgressReporter>,
    ) -> Result<JobOutcome> {
        let kind = job.operation.kind;
        let session_id = job.operation.session_id.clone();
        let mut subscription = match self.hub.subscribe(kind, &session_id) {
            Ok(subscription) => subscription,
            Err(e) => {
                let now = chrono::Utc::now().timestamp();
                let message = e.to_string();
                if let Err(release_err) = self
                    .gate
                    .release(
                        &job.operation.id,
                        OperationStatus::Failed,
                        None,
                        Some(message.as_str()),
                        now,
                    )
                    .await
                {
                    error!(operation = %job.operation.id, error = %release_err, "could not fail operation");
                }
                return Err(e);
            }
        };
        let printer = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                reporter.report(&event);
            }
        });

        let workers = self.start_workers();
        let outcome = workers
            .enqueue(job)?
            .await
            .context("worker dropped the job")?;
        workers.shutdown().await;
        if outcome == JobOutcome::Skipped {
            self.hub.close(kind, &session_id);
        }
        let _ = printer.await;
        Ok(outcome)
    }
}
