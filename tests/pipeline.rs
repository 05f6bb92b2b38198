//! End-to-end tests of the comparison pipeline, deep-analysis jobs, and
//! batch categorization against the in-memory store and scripted services.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use repo_compare::app::{App, Services};
use repo_compare::categorize::{run_batch, BatchStop};
use repo_compare::completion::{Completion, TextCompletionService};
use repo_compare::config::{parse_config, BatchConfig, Config};
use repo_compare::error::{PipelineError, UpstreamError};
use repo_compare::jobs::JobOutcome;
use repo_compare::ledger::ledger_date;
use repo_compare::jobs::{JobPayload, QueuedJob};
use repo_compare::progress::{EventType, NoProgress};
use repo_compare::search_source::{Readme, SourceSearch};
use repo_compare_core::models::{
    AnalysisKind, NewComparison, OperationKind, OperationStatus, SourceRepository,
};
use repo_compare_core::pricing::TokenUsage;
use repo_compare_core::store::memory::InMemoryStore;
use repo_compare_core::store::Store;

const QUERY: &str = "Rails background jobs with retry logic";

// ─── Scripted services ──────────────────────────────────────────────

struct ScriptedSource {
    results: HashMap<String, Vec<SourceRepository>>,
    trending: Vec<SourceRepository>,
}

#[async_trait]
impl SourceSearch for ScriptedSource {
    async fn search(&self, query: &str, page_size: usize) -> Result<Vec<SourceRepository>> {
        Ok(self
            .results
            .get(query)
            .map(|items| items.iter().take(page_size).cloned().collect())
            .unwrap_or_default())
    }

    async fn search_trending(
        &self,
        _days_ago: i64,
        min_stars: i64,
        page_size: usize,
    ) -> Result<Vec<SourceRepository>> {
        Ok(self
            .trending
            .iter()
            .filter(|r| r.stars >= min_stars)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn fetch_readme(&self, full_name: &str) -> Result<Option<Readme>> {
        Ok(Some(Readme::new(format!(
            "# {}\n\nSimple, efficient background processing.",
            full_name
        ))))
    }
}

/// Answers each prompt kind with a fixed payload and counts calls.
struct ScriptedCompletion {
    interpretation: Value,
    ranking: Value,
    /// Interpretation calls that time out before one succeeds.
    interpret_timeouts: AtomicUsize,
    interpret_calls: AtomicUsize,
    analysis_calls: AtomicUsize,
    ranking_calls: AtomicUsize,
    /// Analyses of this repository fail.
    failing_repo: Option<&'static str>,
}

impl ScriptedCompletion {
    fn new(interpretation: Value, ranking: Value) -> Self {
        Self {
            interpretation,
            ranking,
            interpret_timeouts: AtomicUsize::new(0),
            interpret_calls: AtomicUsize::new(0),
            analysis_calls: AtomicUsize::new(0),
            ranking_calls: AtomicUsize::new(0),
            failing_repo: None,
        }
    }

    fn failing_analysis_of(mut self, full_name: &'static str) -> Self {
        self.failing_repo = Some(full_name);
        self
    }

    fn timing_out(self, times: usize) -> Self {
        self.interpret_timeouts.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl TextCompletionService for ScriptedCompletion {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, model: &str) -> Result<Completion> {
        let content = if system_prompt.contains("decide whether it asks for software") {
            self.interpret_calls.fetch_add(1, Ordering::SeqCst);
            if self.interpret_timeouts.load(Ordering::SeqCst) > 0 {
                self.interpret_timeouts.fetch_sub(1, Ordering::SeqCst);
                return Err(UpstreamError::Timeout {
                    service: "openai chat",
                }
                .into());
            }
            self.interpretation.clone()
        } else if system_prompt.contains("cataloguing")
            || system_prompt.contains("reviewing an open-source repository")
        {
            self.analysis_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(name) = self.failing_repo {
                if user_prompt.contains(name) {
                    bail!("model refused to analyze {}", name);
                }
            }
            json!({
                "summary": "Background job processing for Ruby.",
                "use_cases": ["email delivery"],
                "technologies": ["Ruby", "Redis"],
                "problem_domains": ["background jobs"],
                "architecture_patterns": ["worker pool"],
                "maturity": "stable",
                "strengths": ["battle tested"],
                "weaknesses": ["needs Redis"]
            })
        } else if system_prompt.contains("You compare open-source repositories") {
            self.ranking_calls.fetch_add(1, Ordering::SeqCst);
            self.ranking.clone()
        } else {
            bail!("unexpected prompt");
        };
        Ok(Completion {
            content,
            usage: TokenUsage::new(1000, 500),
            model: model.to_string(),
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn repo(github_id: i64, full_name: &str, stars: i64) -> SourceRepository {
    let (owner, name) = full_name.split_once('/').unwrap();
    SourceRepository {
        github_id,
        node_id: format!("R_{}", github_id),
        full_name: full_name.to_string(),
        name: name.to_string(),
        owner: owner.to_string(),
        description: Some(format!("{} for Ruby", name)),
        html_url: format!("https://github.com/{}", full_name),
        stars,
        forks: stars / 10,
        open_issues: 3,
        language: Some("Ruby".to_string()),
        topics: vec!["jobs".to_string()],
        created_at: Some(1_500_000_000),
        updated_at: Some(1_700_000_000),
        pushed_at: Some(1_700_000_000),
        archived: false,
    }
}

fn valid_interpretation() -> Value {
    json!({
        "valid": true,
        "tech_stack": ["Ruby", "Rails"],
        "problem_domain": "background jobs",
        "architecture_patterns": ["queue"],
        "constraints": ["retries"],
        "search_queries": ["rails background jobs", "ruby job queue"],
        "strategy": "framework-specific first, then general"
    })
}

fn ranking() -> Value {
    json!({
        "recommended": "mperham/sidekiq",
        "recommendation_reason": "Most mature option with built-in retries.",
        "ranking": [
            {"full_name": "mperham/sidekiq", "score": 92, "pros": ["fast"], "cons": ["Redis"], "fit_reasoning": "Retries out of the box."},
            {"full_name": "nobody/not-offered", "score": 99},
            {"full_name": "bensheldon/good_job", "score": 85, "pros": ["Postgres only"], "cons": [], "fit_reasoning": "No Redis needed."},
            {"full_name": "collectiveidea/delayed_job", "score": 60}
        ]
    })
}

fn source() -> ScriptedSource {
    let sidekiq = repo(1, "mperham/sidekiq", 13_000);
    let good_job = repo(2, "bensheldon/good_job", 2_500);
    let delayed = repo(3, "collectiveidea/delayed_job", 4_800);
    let mut results = HashMap::new();
    results.insert(
        "rails background jobs".to_string(),
        vec![good_job.clone(), sidekiq.clone()],
    );
    results.insert("ruby job queue".to_string(), vec![sidekiq, delayed]);
    ScriptedSource {
        results,
        trending: vec![repo(10, "new/rising", 900), repo(11, "new/quiet", 20)],
    }
}

fn test_config(extra: &str) -> Config {
    parse_config(&format!(
        "[db]\npath = \"unused.sqlite\"\n\n[jobs]\nsubscriber_grace_ms = 0\nbase_backoff_ms = 1\nmax_backoff_ms = 5\n{}",
        extra
    ))
    .unwrap()
}

struct Harness {
    app: App,
    store: Arc<dyn Store>,
    completion: Arc<ScriptedCompletion>,
}

fn harness(config: Config, completion: ScriptedCompletion, source: ScriptedSource) -> Harness {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let completion = Arc::new(completion);
    let services = Services {
        source: Arc::new(source),
        completion: completion.clone(),
        embedder: None,
    };
    let app = App::new(Arc::new(config), store.clone(), services).unwrap();
    Harness {
        app,
        store,
        completion,
    }
}

fn default_harness() -> Harness {
    harness(
        test_config(""),
        ScriptedCompletion::new(valid_interpretation(), ranking()),
        source(),
    )
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─── Comparison pipeline ────────────────────────────────────────────

#[tokio::test]
async fn comparison_runs_end_to_end() {
    let h = default_harness();
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "session-1", Some(2), now())
        .await
        .unwrap();
    let op_id = job.operation.id.clone();
    let mut progress = h.app.hub.subscribe(job.operation.kind, "session-1").unwrap();

    let outcome = h.app.runner().run(job).await;
    let JobOutcome::Completed(done) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(done.redirect_target, format!("/comparisons/{}", done.result_id));

    // Three distinct repositories across both queries; the top two by
    // stars are analyzed and offered for ranking.
    assert_eq!(h.store.repository_count().await.unwrap(), 3);
    assert_eq!(h.completion.analysis_calls.load(Ordering::SeqCst), 2);

    let entries = h.store.comparison_entries(done.result_id).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.repository_full_name.as_str()).collect();
    assert_eq!(names, vec!["mperham/sidekiq", "collectiveidea/delayed_job"]);
    assert_eq!(entries[0].rank, 1);
    assert_eq!(entries[1].rank, 2);

    let comparison = h.store.get_comparison(done.result_id).await.unwrap().unwrap();
    assert_eq!(comparison.recommended_repo_full_name.as_deref(), Some("mperham/sidekiq"));
    assert_eq!(comparison.normalized_query, "rails background jobs with retry logic");
    assert_eq!(comparison.repos_compared, 2);

    let categories = h.store.comparison_categories(done.result_id).await.unwrap();
    assert!(categories.iter().any(|c| c.category.name == "Background Jobs"));

    let op = h.store.get_operation(&op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.result_id, Some(done.result_id));

    // interpretation + two analyses + ranking
    let entries = h.app.ledger.entries_for(now()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].total_requests, 4);
    assert_eq!(entries[0].date, ledger_date(now()));

    let mut events = Vec::new();
    while let Some(event) = progress.next().await {
        events.push(event);
    }
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert_eq!(last.redirect_target.as_deref(), Some(done.redirect_target.as_str()));
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| e.event_type == EventType::Progress));
    assert_eq!(h.app.hub.open_topics(), 0);
}

#[tokio::test]
async fn similar_request_reuses_cached_comparison() {
    let h = default_harness();
    let first = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let JobOutcome::Completed(first) = h.app.runner().run(first).await else {
        panic!("first comparison failed");
    };

    let second = h
        .app
        .pipeline
        .submit("  rails BACKGROUND jobs with retry logic ", "bob", "s2", None, now())
        .await
        .unwrap();
    let JobOutcome::Completed(second) = h.app.runner().run(second).await else {
        panic!("second comparison failed");
    };

    assert_eq!(second.result_id, first.result_id);
    assert_eq!(h.completion.interpret_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.completion.ranking_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_lookup_respects_threshold_and_ttl() {
    let h = default_harness();
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let JobOutcome::Completed(done) = h.app.runner().run(job).await else {
        panic!("comparison failed");
    };

    let t = now();
    let (hit, score) = h
        .app
        .pipeline
        .find_similar_cached("Rails background jobs with retry logic", t)
        .await
        .unwrap();
    assert_eq!(hit.map(|c| c.id), Some(done.result_id));
    assert!(score >= 0.8);

    let (miss, score) = h
        .app
        .pipeline
        .find_similar_cached("python web scraping", t)
        .await
        .unwrap();
    assert!(miss.is_none());
    assert_eq!(score, 0.0);

    let (expired, score) = h
        .app
        .pipeline
        .find_similar_cached(QUERY, t + 169 * 3600)
        .await
        .unwrap();
    assert!(expired.is_none());
    assert_eq!(score, 0.0);
}

fn cached(query: &str, created_at: i64) -> NewComparison {
    NewComparison {
        user_query: query.to_string(),
        normalized_query: query.to_lowercase(),
        technologies: Vec::new(),
        problem_domains: Vec::new(),
        architecture_patterns: Vec::new(),
        constraints: Vec::new(),
        search_queries: Vec::new(),
        recommended_repo_full_name: None,
        recommendation_reason: None,
        ranking: json!({}),
        repos_compared: 0,
        model: "gpt-4o-mini".to_string(),
        input_tokens: 0,
        output_tokens: 0,
        cost_usd: 0.0,
        created_at,
    }
}

#[tokio::test]
async fn equally_similar_cache_entries_prefer_most_recent() {
    let h = default_harness();
    let t = now();
    let older = h
        .store
        .insert_comparison(&cached(QUERY, t - 7200), &[])
        .await
        .unwrap();
    let newer = h
        .store
        .insert_comparison(&cached(QUERY, t - 60), &[])
        .await
        .unwrap();
    assert!(older.id < newer.id);
    // An older row inserted last must not win on id alone.
    h.store
        .insert_comparison(&cached(QUERY, t - 3600), &[])
        .await
        .unwrap();

    let (hit, score) = h.app.pipeline.find_similar_cached(QUERY, t).await.unwrap();
    assert_eq!(hit.map(|c| c.id), Some(newer.id));
    assert!(score >= 0.99);
}

#[tokio::test]
async fn failed_analysis_is_skipped_and_comparison_completes() {
    let h = harness(
        test_config(""),
        ScriptedCompletion::new(valid_interpretation(), ranking())
            .failing_analysis_of("collectiveidea/delayed_job"),
        source(),
    );
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", Some(2), now())
        .await
        .unwrap();
    let JobOutcome::Completed(done) = h.app.runner().run(job).await else {
        panic!("comparison should survive one failed analysis");
    };
    assert_eq!(h.completion.analysis_calls.load(Ordering::SeqCst), 2);

    let entries = h.store.comparison_entries(done.result_id).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.repository_full_name.as_str()).collect();
    assert_eq!(names, vec!["mperham/sidekiq", "collectiveidea/delayed_job"]);

    let delayed = h
        .store
        .find_repository_by_full_name("collectiveidea/delayed_job")
        .await
        .unwrap()
        .unwrap();
    assert!(h
        .store
        .current_analysis(delayed.id, AnalysisKind::Basic)
        .await
        .unwrap()
        .is_none());

    // interpretation + one successful analysis + ranking
    let ledger = h.app.ledger.entries_for(now()).await.unwrap();
    assert_eq!(ledger[0].total_requests, 3);
}

#[tokio::test]
async fn off_topic_request_fails_without_retry() {
    let h = harness(
        test_config(""),
        ScriptedCompletion::new(
            json!({"valid": false, "validation_message": "Recipes are not software."}),
            ranking(),
        ),
        source(),
    );
    let job = h
        .app
        .pipeline
        .submit("best lasagna recipe", "alice", "s1", None, now())
        .await
        .unwrap();
    let op_id = job.operation.id.clone();
    let mut progress = h.app.hub.subscribe(job.operation.kind, "s1").unwrap();

    let outcome = h.app.runner().run(job).await;
    assert_eq!(
        outcome,
        JobOutcome::Failed(PipelineError::InvalidQuery("Recipes are not software.".into()))
    );
    assert_eq!(h.completion.interpret_calls.load(Ordering::SeqCst), 1);

    let op = h.store.get_operation(&op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);

    let mut last = None;
    while let Some(event) = progress.next().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.event_type, EventType::Error);
    assert_eq!(last.message, "Recipes are not software.");
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = harness(
        test_config(""),
        ScriptedCompletion::new(valid_interpretation(), ranking()).timing_out(2),
        source(),
    );
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let outcome = h.app.runner().run(job).await;
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(h.completion.interpret_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let h = harness(
        test_config(""),
        ScriptedCompletion::new(valid_interpretation(), ranking()).timing_out(10),
        source(),
    );
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let op_id = job.operation.id.clone();
    let outcome = h.app.runner().run(job).await;
    assert!(matches!(outcome, JobOutcome::Failed(PipelineError::Transient(_))));
    assert_eq!(h.completion.interpret_calls.load(Ordering::SeqCst), 3);

    let op = h.store.get_operation(&op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(h.store.pending_cost_since(0).await.unwrap(), 0.0);
}

#[tokio::test]
async fn empty_search_is_no_results() {
    let h = harness(
        test_config(""),
        ScriptedCompletion::new(valid_interpretation(), ranking()),
        ScriptedSource {
            results: HashMap::new(),
            trending: Vec::new(),
        },
    );
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let outcome = h.app.runner().run(job).await;
    assert!(matches!(outcome, JobOutcome::Failed(PipelineError::NoResults { .. })));
    assert_eq!(h.completion.ranking_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn finished_operation_is_not_run_twice() {
    let h = default_harness();
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let again = job.clone();
    assert!(matches!(h.app.runner().run(job).await, JobOutcome::Completed(_)));
    assert_eq!(h.app.runner().run(again).await, JobOutcome::Skipped);
    assert_eq!(h.completion.interpret_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_pool_delivers_outcomes() {
    let h = default_harness();
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let workers = h.app.start_workers();
    let outcome = workers.enqueue(job).unwrap().await.unwrap();
    workers.shutdown().await;
    assert!(matches!(outcome, JobOutcome::Completed(_)));
}

#[tokio::test]
async fn reported_run_of_finished_operation_returns() {
    let h = default_harness();
    let job = h
        .app
        .pipeline
        .submit(QUERY, "alice", "s1", None, now())
        .await
        .unwrap();
    let again = job.clone();
    let first = h.app.run_reported(job, Box::new(NoProgress)).await.unwrap();
    assert!(matches!(first, JobOutcome::Completed(_)));

    let second = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        h.app.run_reported(again, Box::new(NoProgress)),
    )
    .await
    .expect("reporter should end when the job is skipped")
    .unwrap();
    assert_eq!(second, JobOutcome::Skipped);
    assert_eq!(h.app.hub.open_topics(), 0);
}

#[tokio::test]
async fn unfollowable_job_releases_its_reservation() {
    let h = default_harness();
    let t = now();
    let operation = h
        .app
        .gate
        .reserve(OperationKind::Analysis, "", "alice", "mperham/sidekiq", t)
        .await
        .unwrap();
    let op_id = operation.id.clone();
    let job = QueuedJob {
        operation,
        payload: JobPayload::Analysis { repository_id: 1 },
    };

    assert!(h.app.run_reported(job, Box::new(NoProgress)).await.is_err());
    let op = h.store.get_operation(&op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(h.store.pending_cost_since(0).await.unwrap(), 0.0);
}

// ─── Submission checks ──────────────────────────────────────────────

#[tokio::test]
async fn blank_and_oversized_queries_are_rejected_synchronously() {
    let h = default_harness();
    let blank = h.app.pipeline.submit("   ", "alice", "s1", None, now()).await;
    assert!(matches!(blank, Err(PipelineError::InvalidQuery(_))));

    let long = "x".repeat(501);
    let long = h.app.pipeline.submit(&long, "alice", "s1", None, now()).await;
    assert!(matches!(long, Err(PipelineError::InvalidQuery(_))));

    let no_session = h.app.pipeline.submit(QUERY, "alice", " ", None, now()).await;
    assert!(matches!(no_session, Err(PipelineError::InvalidQuery(_))));

    assert_eq!(h.store.pending_cost_since(0).await.unwrap(), 0.0);
}

#[tokio::test]
async fn exhausted_budget_rejects_before_queueing() {
    let h = harness(
        test_config("\n[budget]\ndaily_budget_usd = 0.04\n"),
        ScriptedCompletion::new(valid_interpretation(), ranking()),
        source(),
    );
    let result = h.app.pipeline.submit(QUERY, "alice", "s1", None, now()).await;
    assert!(matches!(result, Err(PipelineError::BudgetExhausted { .. })));
    assert_eq!(h.store.pending_cost_since(0).await.unwrap(), 0.0);
}

#[tokio::test]
async fn per_user_cap_applies_to_everyone_but_admins() {
    let h = harness(
        test_config("\n[budget]\nper_user_daily_limit = 1\nadmin_user_ids = [\"root\"]\n"),
        ScriptedCompletion::new(valid_interpretation(), ranking()),
        source(),
    );
    let t = now();
    assert!(h.app.pipeline.submit(QUERY, "alice", "s1", None, t).await.is_ok());
    let second = h.app.pipeline.submit(QUERY, "alice", "s2", None, t).await;
    assert_eq!(
        second.unwrap_err(),
        PipelineError::UserLimitReached { count: 1, limit: 1 }
    );
    assert!(h.app.pipeline.submit(QUERY, "root", "s3", None, t).await.is_ok());
    assert!(h.app.pipeline.submit(QUERY, "root", "s4", None, t).await.is_ok());
}

#[tokio::test]
async fn reservations_count_against_remaining_budget() {
    let h = harness(
        test_config("\n[budget]\ndaily_budget_usd = 0.10\ncomparison_reservation_usd = 0.05\n"),
        ScriptedCompletion::new(valid_interpretation(), ranking()),
        source(),
    );
    let t = now();
    let first = h.app.pipeline.submit(QUERY, "a", "s1", None, t).await.unwrap();
    h.app.pipeline.submit(QUERY, "b", "s2", None, t).await.unwrap();
    let status = h.app.gate.status(t).await.unwrap();
    assert!((status.pending_usd - 0.10).abs() < 1e-9);
    assert_eq!(status.remaining_usd, 0.0);
    assert!(!status.can_create);
    assert!(matches!(
        h.app.pipeline.submit(QUERY, "c", "s3", None, t).await,
        Err(PipelineError::BudgetExhausted { .. })
    ));

    // Finishing a job releases its reservation.
    h.app.runner().run(first).await;
    let status = h.app.gate.status(now()).await.unwrap();
    assert!((status.pending_usd - 0.05).abs() < 1e-9);
}

// ─── Deep analysis ──────────────────────────────────────────────────

#[tokio::test]
async fn deep_analysis_job_reads_readme() {
    let h = default_harness();
    let t = now();
    let stored = h
        .store
        .upsert_repository(&repo(1, "mperham/sidekiq", 13_000), t)
        .await
        .unwrap()
        .repository;

    let unknown = h
        .app
        .deep_analysis
        .submit("someone/unknown", "alice", "s1", t)
        .await;
    assert!(matches!(unknown, Err(PipelineError::InvalidQuery(_))));

    let no_session = h
        .app
        .deep_analysis
        .submit("mperham/sidekiq", "alice", "  ", t)
        .await;
    assert!(matches!(no_session, Err(PipelineError::InvalidQuery(_))));
    assert_eq!(h.store.pending_cost_since(0).await.unwrap(), 0.0);

    let job = h
        .app
        .deep_analysis
        .submit("mperham/sidekiq", "alice", "s1", t)
        .await
        .unwrap();
    let JobOutcome::Completed(done) = h.app.runner().run(job).await else {
        panic!("deep analysis failed");
    };
    assert_eq!(done.redirect_target, format!("/repositories/{}", stored.id));

    let deep = h
        .store
        .current_analysis(stored.id, AnalysisKind::Deep)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deep.id, done.result_id);
    let repository = h.store.get_repository(stored.id).await.unwrap().unwrap();
    assert!(repository.readme_sha.is_some());
    assert!(!h.store.repository_categories(stored.id).await.unwrap().is_empty());
}

// ─── Batch categorization and sync ──────────────────────────────────

#[tokio::test]
async fn categorization_batch_stops_at_item_cap() {
    let h = default_harness();
    let t = now();
    for i in 0..25 {
        h.store
            .upsert_repository(&repo(100 + i, &format!("owner/repo{}", i), 1000 - i), t)
            .await
            .unwrap();
    }

    let config = BatchConfig {
        max_items: 20,
        cost_ceiling_usd: 1.0,
    };
    let report = run_batch(h.store.as_ref(), &h.app.analyzer, &config, t)
        .await
        .unwrap();
    assert_eq!(report.processed, 20);
    assert_eq!(report.remaining, 5);
    assert_eq!(report.stopped_by, Some(BatchStop::ItemCap));

    let report = run_batch(h.store.as_ref(), &h.app.analyzer, &config, t)
        .await
        .unwrap();
    assert_eq!(report.processed, 5);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.stopped_by, None);
}

#[tokio::test]
async fn categorization_batch_stops_at_cost_ceiling() {
    let h = default_harness();
    let t = now();
    for i in 0..10 {
        h.store
            .upsert_repository(&repo(200 + i, &format!("owner/cheap{}", i), 500 - i), t)
            .await
            .unwrap();
    }

    // Each analysis costs $0.00045 at gpt-4o-mini rates.
    let config = BatchConfig {
        max_items: 20,
        cost_ceiling_usd: 0.001,
    };
    let report = run_batch(h.store.as_ref(), &h.app.analyzer, &config, t)
        .await
        .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.remaining, 7);
    assert_eq!(report.stopped_by, Some(BatchStop::CostCeiling));
}

#[tokio::test]
async fn trending_sync_upserts_without_duplicates() {
    let h = default_harness();
    let config = test_config("\n[sync]\nmin_stars = 100\n");
    let t = now();

    let report = repo_compare::sync::sync_trending(
        h.store.as_ref(),
        h.app.services.source.as_ref(),
        &config.sync,
        t,
    )
    .await
    .unwrap();
    assert_eq!((report.fetched, report.created, report.updated), (1, 1, 0));

    let report = repo_compare::sync::sync_trending(
        h.store.as_ref(),
        h.app.services.source.as_ref(),
        &config.sync,
        t + 60,
    )
    .await
    .unwrap();
    assert_eq!((report.fetched, report.created, report.updated), (1, 0, 1));

    let stored = h
        .store
        .find_repository_by_full_name("new/rising")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.fetch_count, 2);
    assert_eq!(h.store.repository_count().await.unwrap(), 1);
}
