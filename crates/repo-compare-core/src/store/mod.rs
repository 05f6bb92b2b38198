//! Storage abstraction for repo-compare.
//!
//! The [`Store`] trait defines every persistence operation the pipeline
//! needs, so the same orchestration runs against SQLite in production and
//! the [`memory::InMemoryStore`] in tests.
//!
//! Side effects that used to hide in lifecycle hooks are explicit store
//! operations here: [`Store::insert_current_analysis`] flips the previous
//! current analysis off in the same step, and [`Store::try_reserve`] reads
//! the budget and inserts the reservation atomically.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Analysis, AnalysisKind, CachedQuery, Category, CategoryType, Comparison, ComparisonCategory,
    ComparisonEntry, CostLedgerEntry, NewAnalysis, NewCategory, NewComparison, OperationStatus,
    PendingOperation, Repository, RepositoryCategory, ReservationOutcome, ReservationRequest,
    SourceRepository, UpsertedRepository,
};

/// Abstract storage backend.
///
/// Implementations must be `Send + Sync`; all operations are async via
/// `async-trait`.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Repositories | [`upsert_repository`](Store::upsert_repository), [`get_repository`](Store::get_repository), [`find_repository_by_full_name`](Store::find_repository_by_full_name), [`repository_count`](Store::repository_count), [`repositories_pending_analysis`](Store::repositories_pending_analysis), [`set_repository_readme`](Store::set_repository_readme) |
/// | Categories | [`categories_by_type`](Store::categories_by_type), [`find_category_by_slug`](Store::find_category_by_slug), [`insert_category`](Store::insert_category), [`set_category_embedding`](Store::set_category_embedding), [`assign_category`](Store::assign_category), [`repository_categories`](Store::repository_categories) |
/// | Analyses | [`insert_current_analysis`](Store::insert_current_analysis), [`current_analysis`](Store::current_analysis), [`list_analyses`](Store::list_analyses) |
/// | Comparisons | [`insert_comparison`](Store::insert_comparison), [`get_comparison`](Store::get_comparison), [`comparison_entries`](Store::comparison_entries), [`cached_queries_since`](Store::cached_queries_since), [`increment_view_count`](Store::increment_view_count), [`link_comparison_category`](Store::link_comparison_category), [`comparison_categories`](Store::comparison_categories), [`list_comparisons`](Store::list_comparisons) |
/// | Costs | [`record_cost`](Store::record_cost), [`ledger_entries`](Store::ledger_entries), [`total_cost_for_date`](Store::total_cost_for_date) |
/// | Operations | [`try_reserve`](Store::try_reserve), [`pending_cost_since`](Store::pending_cost_since), [`user_operation_count_since`](Store::user_operation_count_since), [`get_operation`](Store::get_operation), [`finish_operation`](Store::finish_operation) |
#[async_trait]
pub trait Store: Send + Sync {
    // ---- repositories ----

    /// Insert or refresh a repository keyed by its stable `github_id`.
    ///
    /// A new row starts with `fetch_count = 1`; refreshing an existing row
    /// updates stats and increments `fetch_count`. Never creates duplicates.
    async fn upsert_repository(&self, item: &SourceRepository, now: i64)
        -> Result<UpsertedRepository>;

    async fn get_repository(&self, id: i64) -> Result<Option<Repository>>;

    async fn find_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>>;

    async fn repository_count(&self) -> Result<i64>;

    /// Repositories without a current basic analysis, most-starred first.
    async fn repositories_pending_analysis(&self, limit: i64) -> Result<Vec<Repository>>;

    async fn set_repository_readme(
        &self,
        id: i64,
        content: &str,
        sha: &str,
        fetched_at: i64,
    ) -> Result<()>;

    // ---- categories ----

    async fn categories_by_type(&self, category_type: CategoryType) -> Result<Vec<Category>>;

    async fn find_category_by_slug(
        &self,
        category_type: CategoryType,
        slug: &str,
    ) -> Result<Option<Category>>;

    /// Insert a category. If `(category_type, slug)` already exists the
    /// existing row is returned unchanged.
    async fn insert_category(&self, category: &NewCategory, now: i64) -> Result<Category>;

    async fn set_category_embedding(&self, id: i64, embedding: &[f32]) -> Result<()>;

    /// Link a category to a repository, replacing any previous confidence.
    async fn assign_category(
        &self,
        repository_id: i64,
        category_id: i64,
        confidence: f64,
        assigned_by: &str,
    ) -> Result<()>;

    async fn repository_categories(&self, repository_id: i64) -> Result<Vec<RepositoryCategory>>;

    // ---- analyses ----

    /// Record an analysis as the current one for its `(repository, kind)`,
    /// turning every earlier analysis of that pair off, and stamp the
    /// repository's `last_analyzed_at`.
    async fn insert_current_analysis(&self, analysis: &NewAnalysis, now: i64) -> Result<Analysis>;

    async fn current_analysis(
        &self,
        repository_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<Analysis>>;

    async fn list_analyses(&self, repository_id: i64, kind: AnalysisKind) -> Result<Vec<Analysis>>;

    // ---- comparisons ----

    /// Persist a comparison and its ranked entries together.
    async fn insert_comparison(
        &self,
        comparison: &NewComparison,
        entries: &[ComparisonEntry],
    ) -> Result<Comparison>;

    async fn get_comparison(&self, id: i64) -> Result<Option<Comparison>>;

    /// Entries ordered by rank ascending.
    async fn comparison_entries(&self, comparison_id: i64) -> Result<Vec<ComparisonEntry>>;

    /// Normalized queries of comparisons created at or after `since`.
    async fn cached_queries_since(&self, since: i64) -> Result<Vec<CachedQuery>>;

    async fn increment_view_count(&self, comparison_id: i64) -> Result<()>;

    async fn link_comparison_category(
        &self,
        comparison_id: i64,
        category_id: i64,
        confidence: Option<f64>,
    ) -> Result<()>;

    async fn comparison_categories(&self, comparison_id: i64) -> Result<Vec<ComparisonCategory>>;

    /// Most recent first.
    async fn list_comparisons(&self, limit: i64) -> Result<Vec<Comparison>>;

    // ---- cost ledger ----

    /// Add one request's usage to the `(date, model)` row, creating it if
    /// needed. Returns the updated row.
    async fn record_cost(
        &self,
        date: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        now: i64,
    ) -> Result<CostLedgerEntry>;

    async fn ledger_entries(&self, date: &str) -> Result<Vec<CostLedgerEntry>>;

    async fn total_cost_for_date(&self, date: &str) -> Result<f64> {
        Ok(self
            .ledger_entries(date)
            .await?
            .iter()
            .fold(0.0, |total, e| total + e.total_cost_usd))
    }

    // ---- pending operations ----

    /// Atomically check the daily budget and per-user cap and, if both
    /// allow it, insert a `processing` operation holding the reservation.
    ///
    /// Allowed iff `spent(date) + pending(since day_start) + request.pending_cost
    /// <= daily_budget` and, when a limit applies, the user has fewer than
    /// `user_daily_limit` operations since `day_start`.
    async fn try_reserve(&self, request: &ReservationRequest) -> Result<ReservationOutcome>;

    /// Sum of `pending_cost_usd` over `processing` operations created at or
    /// after `since`.
    async fn pending_cost_since(&self, since: i64) -> Result<f64>;

    async fn user_operation_count_since(&self, user_id: &str, since: i64) -> Result<i64>;

    async fn get_operation(&self, id: &str) -> Result<Option<PendingOperation>>;

    /// Move a `processing` operation to a terminal status, releasing its
    /// reservation. Returns `false` (and changes nothing) if the operation
    /// is already terminal or unknown.
    async fn finish_operation(
        &self,
        id: &str,
        status: OperationStatus,
        result_id: Option<i64>,
        error_message: Option<&str>,
        now: i64,
    ) -> Result<bool>;
}
