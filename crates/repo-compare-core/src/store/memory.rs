//! In-memory [`Store`] implementation for tests and embedding in other tools.
//!
//! All tables live behind one `std::sync::Mutex`, which gives every
//! operation (including [`Store::try_reserve`]) the same atomicity the
//! SQLite store gets from its write lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    Analysis, AnalysisKind, CachedQuery, Category, CategoryType, Comparison, ComparisonCategory,
    ComparisonEntry, CostLedgerEntry, NewAnalysis, NewCategory, NewComparison, OperationStatus,
    PendingOperation, Repository, RepositoryCategory, ReservationOutcome, ReservationRequest,
    SourceRepository, UpsertOutcome, UpsertedRepository,
};

use super::Store;

#[derive(Default)]
struct Tables {
    next_id: i64,
    repositories: Vec<Repository>,
    categories: Vec<Category>,
    repository_categories: Vec<(i64, i64, f64, String)>,
    analyses: Vec<Analysis>,
    comparisons: Vec<Comparison>,
    comparison_entries: HashMap<i64, Vec<ComparisonEntry>>,
    comparison_categories: Vec<(i64, i64, Option<f64>)>,
    ledger: Vec<CostLedgerEntry>,
    operations: Vec<PendingOperation>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn category(&self, id: i64) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    fn spent_on(&self, date: &str) -> f64 {
        self.ledger
            .iter()
            .filter(|e| e.date == date)
            .fold(0.0, |total, e| total + e.total_cost_usd)
    }

    fn pending_since(&self, since: i64) -> f64 {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Processing && op.created_at >= since)
            .fold(0.0, |total, op| total + op.pending_cost_usd)
    }

    fn user_count_since(&self, user_id: &str, since: i64) -> i64 {
        self.operations
            .iter()
            .filter(|op| op.user_id == user_id && op.created_at >= since)
            .count() as i64
    }
}

/// In-memory store.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_repository(
        &self,
        item: &SourceRepository,
        now: i64,
    ) -> Result<UpsertedRepository> {
        let mut t = self.lock()?;
        if let Some(existing) = t
            .repositories
            .iter_mut()
            .find(|r| r.github_id == item.github_id)
        {
            existing.node_id = item.node_id.clone();
            existing.full_name = item.full_name.clone();
            existing.name = item.name.clone();
            existing.owner = item.owner.clone();
            existing.description = item.description.clone();
            existing.html_url = item.html_url.clone();
            existing.stars = item.stars;
            existing.forks = item.forks;
            existing.open_issues = item.open_issues;
            existing.language = item.language.clone();
            existing.topics = item.topics.clone();
            existing.github_created_at = item.created_at;
            existing.github_updated_at = item.updated_at;
            existing.github_pushed_at = item.pushed_at;
            existing.archived = item.archived;
            existing.fetch_count += 1;
            existing.last_fetched_at = now;
            existing.updated_at = now;
            return Ok(UpsertedRepository {
                repository: existing.clone(),
                outcome: UpsertOutcome::Updated,
            });
        }

        if t
            .repositories
            .iter()
            .any(|r| r.node_id == item.node_id || r.full_name == item.full_name)
        {
            bail!(
                "repository identity conflict for {} (node_id or full_name already taken)",
                item.full_name
            );
        }

        let id = t.next_id();
        let repository = Repository {
            id,
            github_id: item.github_id,
            node_id: item.node_id.clone(),
            full_name: item.full_name.clone(),
            name: item.name.clone(),
            owner: item.owner.clone(),
            description: item.description.clone(),
            html_url: item.html_url.clone(),
            stars: item.stars,
            forks: item.forks,
            open_issues: item.open_issues,
            language: item.language.clone(),
            topics: item.topics.clone(),
            github_created_at: item.created_at,
            github_updated_at: item.updated_at,
            github_pushed_at: item.pushed_at,
            archived: item.archived,
            readme_content: None,
            readme_sha: None,
            readme_fetched_at: None,
            fetch_count: 1,
            last_fetched_at: now,
            last_analyzed_at: None,
            created_at: now,
            updated_at: now,
        };
        t.repositories.push(repository.clone());
        Ok(UpsertedRepository {
            repository,
            outcome: UpsertOutcome::Created,
        })
    }

    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let t = self.lock()?;
        Ok(t.repositories.iter().find(|r| r.id == id).cloned())
    }

    async fn find_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>> {
        let t = self.lock()?;
        Ok(t
            .repositories
            .iter()
            .find(|r| r.full_name.eq_ignore_ascii_case(full_name))
            .cloned())
    }

    async fn repository_count(&self) -> Result<i64> {
        Ok(self.lock()?.repositories.len() as i64)
    }

    async fn repositories_pending_analysis(&self, limit: i64) -> Result<Vec<Repository>> {
        let t = self.lock()?;
        let mut pending: Vec<Repository> = t
            .repositories
            .iter()
            .filter(|r| {
                !t.analyses.iter().any(|a| {
                    a.repository_id == r.id && a.is_current && a.kind() == AnalysisKind::Basic
                })
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.stars.cmp(&a.stars).then(a.id.cmp(&b.id)));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn set_repository_readme(
        &self,
        id: i64,
        content: &str,
        sha: &str,
        fetched_at: i64,
    ) -> Result<()> {
        let mut t = self.lock()?;
        let repo = t
            .repositories
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("repository {} not found", id))?;
        repo.readme_content = Some(content.to_string());
        repo.readme_sha = Some(sha.to_string());
        repo.readme_fetched_at = Some(fetched_at);
        Ok(())
    }

    async fn categories_by_type(&self, category_type: CategoryType) -> Result<Vec<Category>> {
        let t = self.lock()?;
        Ok(t.categories
            .iter()
            .filter(|c| c.category_type == category_type)
            .cloned()
            .collect())
    }

    async fn find_category_by_slug(
        &self,
        category_type: CategoryType,
        slug: &str,
    ) -> Result<Option<Category>> {
        let t = self.lock()?;
        Ok(t.categories
            .iter()
            .find(|c| c.category_type == category_type && c.slug == slug)
            .cloned())
    }

    async fn insert_category(&self, category: &NewCategory, now: i64) -> Result<Category> {
        let mut t = self.lock()?;
        if let Some(existing) = t
            .categories
            .iter()
            .find(|c| c.category_type == category.category_type && c.slug == category.slug)
        {
            return Ok(existing.clone());
        }
        let id = t.next_id();
        let created = Category {
            id,
            name: category.name.clone(),
            slug: category.slug.clone(),
            category_type: category.category_type,
            description: category.description.clone(),
            embedding: category.embedding.clone(),
            created_at: now,
        };
        t.categories.push(created.clone());
        Ok(created)
    }

    async fn set_category_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        let mut t = self.lock()?;
        let category = t
            .categories
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("category {} not found", id))?;
        category.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn assign_category(
        &self,
        repository_id: i64,
        category_id: i64,
        confidence: f64,
        assigned_by: &str,
    ) -> Result<()> {
        let mut t = self.lock()?;
        t.repository_categories
            .retain(|(r, c, _, _)| !(*r == repository_id && *c == category_id));
        t.repository_categories.push((
            repository_id,
            category_id,
            confidence,
            assigned_by.to_string(),
        ));
        Ok(())
    }

    async fn repository_categories(&self, repository_id: i64) -> Result<Vec<RepositoryCategory>> {
        let t = self.lock()?;
        Ok(t.repository_categories
            .iter()
            .filter(|(r, _, _, _)| *r == repository_id)
            .filter_map(|(_, c, confidence, by)| {
                t.category(*c).map(|category| RepositoryCategory {
                    category: category.clone(),
                    confidence: *confidence,
                    assigned_by: by.clone(),
                })
            })
            .collect())
    }

    async fn insert_current_analysis(&self, analysis: &NewAnalysis, now: i64) -> Result<Analysis> {
        let mut t = self.lock()?;
        let kind = analysis.details.kind();
        if !t.repositories.iter().any(|r| r.id == analysis.repository_id) {
            bail!("repository {} not found", analysis.repository_id);
        }
        for prior in t
            .analyses
            .iter_mut()
            .filter(|a| a.repository_id == analysis.repository_id && a.kind() == kind)
        {
            prior.is_current = false;
        }
        let id = t.next_id();
        let created = Analysis {
            id,
            repository_id: analysis.repository_id,
            model: analysis.model.clone(),
            input_tokens: analysis.input_tokens,
            output_tokens: analysis.output_tokens,
            cost_usd: analysis.cost_usd,
            is_current: true,
            created_at: now,
            details: analysis.details.clone(),
        };
        t.analyses.push(created.clone());
        if let Some(repo) = t
            .repositories
            .iter_mut()
            .find(|r| r.id == analysis.repository_id)
        {
            repo.last_analyzed_at = Some(now);
        }
        Ok(created)
    }

    async fn current_analysis(
        &self,
        repository_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<Analysis>> {
        let t = self.lock()?;
        Ok(t.analyses
            .iter()
            .find(|a| a.repository_id == repository_id && a.kind() == kind && a.is_current)
            .cloned())
    }

    async fn list_analyses(&self, repository_id: i64, kind: AnalysisKind) -> Result<Vec<Analysis>> {
        let t = self.lock()?;
        Ok(t.analyses
            .iter()
            .filter(|a| a.repository_id == repository_id && a.kind() == kind)
            .cloned()
            .collect())
    }

    async fn insert_comparison(
        &self,
        comparison: &NewComparison,
        entries: &[ComparisonEntry],
    ) -> Result<Comparison> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let created = Comparison {
            id,
            user_query: comparison.user_query.clone(),
            normalized_query: comparison.normalized_query.clone(),
            technologies: comparison.technologies.clone(),
            problem_domains: comparison.problem_domains.clone(),
            architecture_patterns: comparison.architecture_patterns.clone(),
            constraints: comparison.constraints.clone(),
            search_queries: comparison.search_queries.clone(),
            recommended_repo_full_name: comparison.recommended_repo_full_name.clone(),
            recommendation_reason: comparison.recommendation_reason.clone(),
            ranking: comparison.ranking.clone(),
            repos_compared: comparison.repos_compared,
            model: comparison.model.clone(),
            input_tokens: comparison.input_tokens,
            output_tokens: comparison.output_tokens,
            cost_usd: comparison.cost_usd,
            view_count: 0,
            created_at: comparison.created_at,
        };
        t.comparisons.push(created.clone());
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.rank);
        t.comparison_entries.insert(id, sorted);
        Ok(created)
    }

    async fn get_comparison(&self, id: i64) -> Result<Option<Comparison>> {
        let t = self.lock()?;
        Ok(t.comparisons.iter().find(|c| c.id == id).cloned())
    }

    async fn comparison_entries(&self, comparison_id: i64) -> Result<Vec<ComparisonEntry>> {
        let t = self.lock()?;
        Ok(t.comparison_entries
            .get(&comparison_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cached_queries_since(&self, since: i64) -> Result<Vec<CachedQuery>> {
        let t = self.lock()?;
        Ok(t.comparisons
            .iter()
            .filter(|c| c.created_at >= since)
            .map(|c| CachedQuery {
                comparison_id: c.id,
                normalized_query: c.normalized_query.clone(),
                created_at: c.created_at,
            })
            .collect())
    }

    async fn increment_view_count(&self, comparison_id: i64) -> Result<()> {
        let mut t = self.lock()?;
        let comparison = t
            .comparisons
            .iter_mut()
            .find(|c| c.id == comparison_id)
            .ok_or_else(|| anyhow!("comparison {} not found", comparison_id))?;
        comparison.view_count += 1;
        Ok(())
    }

    async fn link_comparison_category(
        &self,
        comparison_id: i64,
        category_id: i64,
        confidence: Option<f64>,
    ) -> Result<()> {
        let mut t = self.lock()?;
        t.comparison_categories
            .retain(|(c, cat, _)| !(*c == comparison_id && *cat == category_id));
        t.comparison_categories
            .push((comparison_id, category_id, confidence));
        Ok(())
    }

    async fn comparison_categories(&self, comparison_id: i64) -> Result<Vec<ComparisonCategory>> {
        let t = self.lock()?;
        Ok(t.comparison_categories
            .iter()
            .filter(|(c, _, _)| *c == comparison_id)
            .filter_map(|(_, cat, confidence)| {
                t.category(*cat).map(|category| ComparisonCategory {
                    category: category.clone(),
                    confidence: *confidence,
                })
            })
            .collect())
    }

    async fn list_comparisons(&self, limit: i64) -> Result<Vec<Comparison>> {
        let t = self.lock()?;
        let mut all = t.comparisons.clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }

    async fn record_cost(
        &self,
        date: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        now: i64,
    ) -> Result<CostLedgerEntry> {
        let mut t = self.lock()?;
        if let Some(entry) = t
            .ledger
            .iter_mut()
            .find(|e| e.date == date && e.model == model)
        {
            entry.total_requests += 1;
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_cost_usd += cost_usd;
            entry.updated_at = now;
            return Ok(entry.clone());
        }
        let entry = CostLedgerEntry {
            date: date.to_string(),
            model: model.to_string(),
            total_requests: 1,
            input_tokens,
            output_tokens,
            total_cost_usd: cost_usd,
            updated_at: now,
        };
        t.ledger.push(entry.clone());
        Ok(entry)
    }

    async fn ledger_entries(&self, date: &str) -> Result<Vec<CostLedgerEntry>> {
        let t = self.lock()?;
        Ok(t.ledger.iter().filter(|e| e.date == date).cloned().collect())
    }

    async fn try_reserve(&self, request: &ReservationRequest) -> Result<ReservationOutcome> {
        let mut t = self.lock()?;

        if let Some(limit) = request.user_daily_limit {
            let count = t.user_count_since(&request.user_id, request.day_start);
            if count >= limit {
                return Ok(ReservationOutcome::UserLimitReached { count, limit });
            }
        }

        let spent = t.spent_on(&request.date);
        let pending = t.pending_since(request.day_start);
        if spent + pending + request.pending_cost_usd > request.daily_budget_usd
            || spent + pending >= request.daily_budget_usd
        {
            return Ok(ReservationOutcome::BudgetExhausted {
                spent_usd: spent,
                pending_usd: pending,
            });
        }

        let operation = PendingOperation {
            id: request.id.clone(),
            kind: request.kind,
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            subject: request.subject.clone(),
            status: OperationStatus::Processing,
            pending_cost_usd: request.pending_cost_usd,
            result_id: None,
            error_message: None,
            created_at: request.now,
            finished_at: None,
        };
        t.operations.push(operation.clone());
        Ok(ReservationOutcome::Reserved(operation))
    }

    async fn pending_cost_since(&self, since: i64) -> Result<f64> {
        Ok(self.lock()?.pending_since(since))
    }

    async fn user_operation_count_since(&self, user_id: &str, since: i64) -> Result<i64> {
        Ok(self.lock()?.user_count_since(user_id, since))
    }

    async fn get_operation(&self, id: &str) -> Result<Option<PendingOperation>> {
        let t = self.lock()?;
        Ok(t.operations.iter().find(|op| op.id == id).cloned())
    }

    async fn finish_operation(
        &self,
        id: &str,
        status: OperationStatus,
        result_id: Option<i64>,
        error_message: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!("finish_operation requires a terminal status, got {}", status.as_str());
        }
        let mut t = self.lock()?;
        match t
            .operations
            .iter_mut()
            .find(|op| op.id == id && op.status == OperationStatus::Processing)
        {
            Some(op) => {
                op.status = status;
                op.result_id = result_id;
                op.error_message = error_message.map(str::to_string);
                op.finished_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
