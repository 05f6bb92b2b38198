//! SQLite store behavior against a real database file.

use std::sync::Arc;
use tempfile::TempDir;

use repo_compare::db;
use repo_compare::migrate;
use repo_compare::sqlite_store::SqliteStore;
use repo_compare_core::models::{
    AnalysisDetails, AnalysisKind, BasicAnalysis, CategoryType, ComparisonEntry, NewAnalysis,
    NewCategory, NewComparison, OperationKind, OperationStatus, ReservationOutcome,
    ReservationRequest, SourceRepository, UpsertOutcome,
};
use repo_compare_core::store::Store;

const NOW: i64 = 1_710_000_000;

async fn open_store(tmp: &TempDir) -> SqliteStore {
    let pool = db::connect_path(&tmp.path().join("data/rcmp.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    // Twice: migrations are idempotent.
    migrate::migrate_pool(&pool).await.unwrap();
    SqliteStore::new(pool)
}

fn item(github_id: i64, full_name: &str, stars: i64) -> SourceRepository {
    let (owner, name) = full_name.split_once('/').unwrap();
    SourceRepository {
        github_id,
        node_id: format!("R_{}", github_id),
        full_name: full_name.to_string(),
        name: name.to_string(),
        owner: owner.to_string(),
        description: Some("Simple, efficient background processing".to_string()),
        html_url: format!("https://github.com/{}", full_name),
        stars,
        forks: 10,
        open_issues: 2,
        language: Some("Ruby".to_string()),
        topics: vec!["jobs".to_string(), "redis".to_string()],
        created_at: Some(NOW - 400 * 86_400),
        updated_at: Some(NOW - 86_400),
        pushed_at: Some(NOW - 86_400),
        archived: false,
    }
}

fn reservation(id: &str, user: &str, budget: f64, limit: Option<i64>) -> ReservationRequest {
    ReservationRequest {
        id: id.to_string(),
        kind: OperationKind::Comparison,
        session_id: format!("session-{}", id),
        user_id: user.to_string(),
        subject: "rails jobs".to_string(),
        pending_cost_usd: 0.25,
        now: NOW,
        date: "2024-03-09".to_string(),
        day_start: NOW - 3600,
        daily_budget_usd: budget,
        user_daily_limit: limit,
    }
}

#[tokio::test]
async fn upsert_refreshes_instead_of_duplicating() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let first = store
        .upsert_repository(&item(1, "mperham/sidekiq", 100), NOW)
        .await
        .unwrap();
    assert_eq!(first.outcome, UpsertOutcome::Created);
    assert_eq!(first.repository.fetch_count, 1);
    assert_eq!(first.repository.topics, vec!["jobs", "redis"]);

    let second = store
        .upsert_repository(&item(1, "mperham/sidekiq", 250), NOW + 60)
        .await
        .unwrap();
    assert_eq!(second.outcome, UpsertOutcome::Updated);
    assert_eq!(second.repository.id, first.repository.id);
    assert_eq!(second.repository.stars, 250);
    assert_eq!(second.repository.fetch_count, 2);
    assert_eq!(second.repository.last_fetched_at, NOW + 60);
    assert_eq!(store.repository_count().await.unwrap(), 1);
}

#[tokio::test]
async fn category_slugs_are_unique_per_type() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let new = |category_type| NewCategory {
        name: "Ruby".to_string(),
        slug: "ruby".to_string(),
        category_type,
        description: "Ruby".to_string(),
        embedding: Some(vec![0.5, 0.25, -1.0]),
    };

    let tech = store.insert_category(&new(CategoryType::Technology), NOW).await.unwrap();
    let again = store.insert_category(&new(CategoryType::Technology), NOW).await.unwrap();
    let domain = store
        .insert_category(&new(CategoryType::ProblemDomain), NOW)
        .await
        .unwrap();

    assert_eq!(tech.id, again.id);
    assert_ne!(tech.id, domain.id);
    assert_eq!(store.categories_by_type(CategoryType::Technology).await.unwrap().len(), 1);

    let found = store
        .find_category_by_slug(CategoryType::Technology, "ruby")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.embedding, Some(vec![0.5, 0.25, -1.0]));
}

#[tokio::test]
async fn only_the_latest_analysis_is_current() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let repo = store
        .upsert_repository(&item(1, "mperham/sidekiq", 100), NOW)
        .await
        .unwrap()
        .repository;

    for (i, summary) in ["first", "second"].iter().enumerate() {
        store
            .insert_current_analysis(
                &NewAnalysis {
                    repository_id: repo.id,
                    model: "gpt-4o-mini".to_string(),
                    input_tokens: 100,
                    output_tokens: 50,
                    cost_usd: 0.001,
                    details: AnalysisDetails::Basic(BasicAnalysis {
                        summary: summary.to_string(),
                        ..BasicAnalysis::default()
                    }),
                },
                NOW + i as i64,
            )
            .await
            .unwrap();
    }

    let all = store.list_analyses(repo.id, AnalysisKind::Basic).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|a| a.is_current).count(), 1);

    let current = store
        .current_analysis(repo.id, AnalysisKind::Basic)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.details.basic().summary, "second");
    assert!(store
        .current_analysis(repo.id, AnalysisKind::Deep)
        .await
        .unwrap()
        .is_none());

    let repo = store.get_repository(repo.id).await.unwrap().unwrap();
    assert_eq!(repo.last_analyzed_at, Some(NOW + 1));
    assert!(store.repositories_pending_analysis(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn comparisons_round_trip_with_ranked_entries() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let a = store
        .upsert_repository(&item(1, "mperham/sidekiq", 100), NOW)
        .await
        .unwrap()
        .repository;
    let b = store
        .upsert_repository(&item(2, "bensheldon/good_job", 50), NOW)
        .await
        .unwrap()
        .repository;

    let entry = |repo: &repo_compare_core::models::Repository, rank: i64| ComparisonEntry {
        repository_id: repo.id,
        repository_full_name: repo.full_name.clone(),
        rank,
        score: 90.0 - rank as f64,
        pros: vec!["fast".to_string()],
        cons: vec![],
        fit_reasoning: "fits".to_string(),
    };
    let comparison = store
        .insert_comparison(
            &NewComparison {
                user_query: "Rails jobs".to_string(),
                normalized_query: "rails jobs".to_string(),
                technologies: vec!["Ruby".to_string()],
                problem_domains: vec!["background jobs".to_string()],
                architecture_patterns: vec![],
                constraints: vec![],
                search_queries: vec!["rails jobs".to_string()],
                recommended_repo_full_name: Some(a.full_name.clone()),
                recommendation_reason: Some("mature".to_string()),
                ranking: serde_json::json!([{"rank": 1, "full_name": a.full_name}]),
                repos_compared: 2,
                model: "gpt-4o-mini".to_string(),
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.0001,
                created_at: NOW,
            },
            &[entry(&b, 2), entry(&a, 1)],
        )
        .await
        .unwrap();

    let entries = store.comparison_entries(comparison.id).await.unwrap();
    let ranks: Vec<(i64, &str)> = entries
        .iter()
        .map(|e| (e.rank, e.repository_full_name.as_str()))
        .collect();
    assert_eq!(ranks, vec![(1, "mperham/sidekiq"), (2, "bensheldon/good_job")]);

    store.increment_view_count(comparison.id).await.unwrap();
    store.increment_view_count(comparison.id).await.unwrap();
    let stored = store.get_comparison(comparison.id).await.unwrap().unwrap();
    assert_eq!(stored.view_count, 2);
    assert_eq!(stored.technologies, vec!["Ruby"]);

    assert_eq!(store.cached_queries_since(NOW).await.unwrap().len(), 1);
    assert!(store.cached_queries_since(NOW + 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn ledger_rows_accumulate_per_date_and_model() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    store
        .record_cost("2024-03-09", "gpt-4o-mini", 1000, 500, 0.00045, NOW)
        .await
        .unwrap();
    store
        .record_cost("2024-03-09", "gpt-4o-mini", 2000, 100, 0.00036, NOW + 1)
        .await
        .unwrap();
    store
        .record_cost("2024-03-09", "gpt-4o", 10, 10, 0.000125, NOW + 2)
        .await
        .unwrap();
    store
        .record_cost("2024-03-10", "gpt-4o-mini", 1, 1, 0.5, NOW + 86_400)
        .await
        .unwrap();

    let entries = store.ledger_entries("2024-03-09").await.unwrap();
    assert_eq!(entries.len(), 2);
    let mini = entries.iter().find(|e| e.model == "gpt-4o-mini").unwrap();
    assert_eq!(mini.total_requests, 2);
    assert_eq!(mini.input_tokens, 3000);
    assert_eq!(mini.output_tokens, 600);
    assert!((mini.total_cost_usd - 0.00081).abs() < 1e-12);

    let total = store.total_cost_for_date("2024-03-09").await.unwrap();
    assert!((total - 0.000935).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_exceed_budget() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open_store(&tmp).await);

    // Room for exactly three $0.25 reservations.
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_reserve(&reservation(&format!("op-{}", i), &format!("user-{}", i), 0.75, Some(10)))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut reserved = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ReservationOutcome::Reserved(_) => reserved += 1,
            ReservationOutcome::BudgetExhausted { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(reserved, 3);
    assert_eq!(store.pending_cost_since(NOW - 3600).await.unwrap(), 0.75);
}

#[tokio::test]
async fn user_cap_and_operation_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let ReservationOutcome::Reserved(op) = store
        .try_reserve(&reservation("a", "alice", 5.0, Some(1)))
        .await
        .unwrap()
    else {
        panic!("first reservation rejected");
    };
    assert_eq!(op.status, OperationStatus::Processing);

    match store
        .try_reserve(&reservation("b", "alice", 5.0, Some(1)))
        .await
        .unwrap()
    {
        ReservationOutcome::UserLimitReached { count, limit } => {
            assert_eq!((count, limit), (1, 1));
        }
        other => panic!("expected user limit, got {:?}", other),
    }
    assert!(matches!(
        store
            .try_reserve(&reservation("c", "alice", 5.0, None))
            .await
            .unwrap(),
        ReservationOutcome::Reserved(_)
    ));

    assert!(store
        .finish_operation("a", OperationStatus::Completed, Some(7), None, NOW + 5)
        .await
        .unwrap());
    assert!(!store
        .finish_operation("a", OperationStatus::Failed, None, Some("late"), NOW + 6)
        .await
        .unwrap());
    let op = store.get_operation("a").await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.result_id, Some(7));
    assert_eq!(op.finished_at, Some(NOW + 5));

    // Only "c" is still holding a reservation.
    assert_eq!(store.pending_cost_since(NOW - 3600).await.unwrap(), 0.25);
    assert_eq!(store.user_operation_count_since("alice", NOW - 3600).await.unwrap(), 2);
}
