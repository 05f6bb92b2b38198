//! Query-to-comparison orchestration.
//!
//! ```text
//! submit ─ validate ─ reserve budget ─▶ QueuedJob
//!                                         │  (worker pool)
//!   attempt: cache? ──hit──▶ complete with the cached comparison
//!              │miss
//!              ▼
//!          interpret ─ invalid ─▶ InvalidQuery
//!              ▼
//!          aggregate ─ nothing ─▶ NoResults
//!              ▼
//!            rank ─▶ complete with the new comparison
//! ```
//!
//! Validation and the budget check run synchronously in [`submit`]; the
//! rest runs as one sequential [`JobHandler::attempt`] so the job runner
//! owns retries and terminal bookkeeping.
//!
//! [`submit`]: ComparisonPipeline::submit

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use repo_compare_core::models::{Comparison, OperationKind};
use repo_compare_core::normalize::normalize_query;
use repo_compare_core::similarity::similarity;
use repo_compare_core::store::Store;

use crate::aggregator::SourceAggregator;
use crate::config::Config;
use crate::error::PipelineError;
use crate::interpreter::{validate_raw_query, QueryInterpreter};
use crate::jobs::{CompletedJob, JobHandler, JobPayload, QueuedJob};
use crate::ledger::{BudgetGate, CostLedger};
use crate::progress::ProgressBroadcaster;
use crate::ranker::ComparisonRanker;

pub struct ComparisonPipeline {
    store: Arc<dyn Store>,
    config: Arc<Config>,
    interpreter: QueryInterpreter,
    aggregator: SourceAggregator,
    ranker: ComparisonRanker,
    ledger: CostLedger,
    gate: Arc<BudgetGate>,
}

impl ComparisonPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<Config>,
        interpreter: QueryInterpreter,
        aggregator: SourceAggregator,
        ranker: ComparisonRanker,
        ledger: CostLedger,
        gate: Arc<BudgetGate>,
    ) -> Self {
        Self {
            store,
            config,
            interpreter,
            aggregator,
            ranker,
            ledger,
            gate,
        }
    }

    /// Accept a comparison request: validate it and reserve budget. Nothing
    /// is queued when either check fails.
    pub async fn submit(
        &self,
        query: &str,
        user_id: &str,
        session_id: &str,
        limit: Option<usize>,
        now: i64,
    ) -> std::result::Result<QueuedJob, PipelineError> {
        validate_raw_query(query, self.config.llm.max_query_length)?;
        if session_id.trim().is_empty() {
            return Err(PipelineError::InvalidQuery(
                "A session id is required to follow progress.".to_string(),
            ));
        }
        let operation = self
            .gate
            .reserve(OperationKind::Comparison, session_id, user_id, query.trim(), now)
            .await?;
        Ok(QueuedJob {
            operation,
            payload: JobPayload::Comparison {
                query: query.trim().to_string(),
                limit: limit.unwrap_or(self.config.aggregator.default_limit),
            },
        })
    }

    /// Most similar comparison created within the cache TTL whose
    /// normalized query clears the similarity threshold. Ties go to the
    /// most recent. `(None, 0.0)` when nothing qualifies.
    pub async fn find_similar_cached(
        &self,
        query: &str,
        now: i64,
    ) -> Result<(Option<Comparison>, f64)> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok((None, 0.0));
        }
        let since = now - self.config.cache.ttl_hours * 3600;
        let threshold = self.config.cache.similarity_threshold;

        let best = self
            .store
            .cached_queries_since(since)
            .await?
            .into_iter()
            .map(|c| (similarity(&normalized, &c.normalized_query), c))
            .filter(|(score, _)| *score >= threshold && *score > 0.0)
            .max_by(|(sa, a), (sb, b)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.comparison_id.cmp(&b.comparison_id))
            });

        match best {
            Some((score, cached)) => {
                let comparison = self.store.get_comparison(cached.comparison_id).await?;
                Ok(match comparison {
                    Some(c) => (Some(c), score),
                    None => (None, 0.0),
                })
            }
            None => Ok((None, 0.0)),
        }
    }

    /// Cache-or-create for one request.
    pub async fn run(
        &self,
        query: &str,
        limit: usize,
        progress: &ProgressBroadcaster,
    ) -> Result<Comparison> {
        let now = chrono::Utc::now().timestamp();

        progress.broadcast_step("cache", "Checking for similar comparisons", Some(5));
        let (cached, score) = self.find_similar_cached(query, now).await?;
        if let Some(comparison) = cached {
            info!(comparison = comparison.id, similarity = score, "cache hit");
            return Ok(comparison);
        }

        progress.broadcast_step("parsing", "Understanding your request", Some(10));
        let interpretation = self.interpreter.parse(query).await?;
        self.ledger
            .record(&interpretation.model, interpretation.usage, now)
            .await?;
        let parsed = interpretation.query;
        if !parsed.valid {
            return Err(PipelineError::InvalidQuery(
                parsed
                    .validation_message
                    .unwrap_or_else(|| "That request could not be understood.".to_string()),
            )
            .into());
        }
        debug!(queries = ?parsed.search_queries, strategy = %parsed.strategy, "query interpreted");

        let aggregate = self
            .aggregator
            .fetch_and_prepare(&parsed.search_queries, limit, now, Some(progress))
            .await?;
        if aggregate.is_empty() {
            return Err(PipelineError::NoResults {
                query: query.to_string(),
            }
            .into());
        }

        progress.broadcast_step(
            "comparing",
            &format!("Comparing {} repositories", aggregate.top.len()),
            Some(80),
        );
        let comparison = self
            .ranker
            .compare(query, &parsed, &aggregate.top, now)
            .await?;
        Ok(comparison)
    }
}

#[async_trait]
impl JobHandler for ComparisonPipeline {
    async fn attempt(
        &self,
        job: &QueuedJob,
        progress: &ProgressBroadcaster,
    ) -> Result<CompletedJob> {
        let JobPayload::Comparison { query, limit } = &job.payload else {
            return Err(
                PipelineError::Internal("comparison handler got an analysis job".into()).into(),
            );
        };
        let comparison = self.run(query, *limit, progress).await?;
        Ok(CompletedJob {
            result_id: comparison.id,
            redirect_target: format!("/comparisons/{}", comparison.id),
            message: "Comparison ready".to_string(),
        })
    }
}
