//! SQLite-backed [`Store`] implementation.
//!
//! List-valued fields are stored as JSON text and category embeddings as
//! little-endian f32 BLOBs. Multi-row effects (flipping the current
//! analysis, writing a comparison with its entries) run in one transaction.
//! The budget reservation is a single conditional `INSERT … SELECT`, so the
//! spent/pending read and the insert happen under one write lock.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use repo_compare_core::embedding::{blob_to_vec, vec_to_blob};
use repo_compare_core::models::{
    Analysis, AnalysisDetails, AnalysisKind, CachedQuery, Category, CategoryType, Comparison,
    ComparisonCategory, ComparisonEntry, CostLedgerEntry, NewAnalysis, NewCategory,
    NewComparison, OperationStatus, PendingOperation, Repository, RepositoryCategory,
    ReservationOutcome, ReservationRequest, SourceRepository, UpsertOutcome, UpsertedRepository,
};
use repo_compare_core::store::Store;

const REPOSITORY_COLUMNS: &str = "id, github_id, node_id, full_name, name, owner, description, \
    html_url, stars, forks, open_issues, language, topics_json, github_created_at, \
    github_updated_at, github_pushed_at, archived, readme_content, readme_sha, \
    readme_fetched_at, fetch_count, last_fetched_at, last_analyzed_at, created_at, updated_at";

const CATEGORY_COLUMNS: &str = "id, name, slug, category_type, description, embedding, created_at";

const ANALYSIS_COLUMNS: &str = "id, repository_id, model, input_tokens, output_tokens, cost_usd, \
    is_current, details_json, created_at";

const COMPARISON_COLUMNS: &str = "id, user_query, normalized_query, technologies_json, \
    problem_domains_json, architecture_patterns_json, constraints_json, search_queries_json, \
    recommended_repo_full_name, recommendation_reason, ranking_json, repos_compared, model, \
    input_tokens, output_tokens, cost_usd, view_count, created_at";

const OPERATION_COLUMNS: &str = "id, kind, session_id, user_id, subject, status, \
    pending_cost_usd, result_id, error_message, created_at, finished_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_json_list(items: &[String]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

fn json_list(row: &SqliteRow, column: &str) -> Result<Vec<String>> {
    let raw: String = row.get(column);
    serde_json::from_str(&raw).with_context(|| format!("corrupt JSON list in column {}", column))
}

fn repository_from_row(row: &SqliteRow) -> Result<Repository> {
    Ok(Repository {
        id: row.get("id"),
        github_id: row.get("github_id"),
        node_id: row.get("node_id"),
        full_name: row.get("full_name"),
        name: row.get("name"),
        owner: row.get("owner"),
        description: row.get("description"),
        html_url: row.get("html_url"),
        stars: row.get("stars"),
        forks: row.get("forks"),
        open_issues: row.get("open_issues"),
        language: row.get("language"),
        topics: json_list(row, "topics_json")?,
        github_created_at: row.get("github_created_at"),
        github_updated_at: row.get("github_updated_at"),
        github_pushed_at: row.get("github_pushed_at"),
        archived: row.get("archived"),
        readme_content: row.get("readme_content"),
        readme_sha: row.get("readme_sha"),
        readme_fetched_at: row.get("readme_fetched_at"),
        fetch_count: row.get("fetch_count"),
        last_fetched_at: row.get("last_fetched_at"),
        last_analyzed_at: row.get("last_analyzed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn category_from_row(row: &SqliteRow) -> Result<Category> {
    let category_type: String = row.get("category_type");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(Category {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        category_type: category_type.parse()?,
        description: row.get("description"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        created_at: row.get("created_at"),
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<Analysis> {
    let details: String = row.get("details_json");
    let details: AnalysisDetails =
        serde_json::from_str(&details).context("corrupt analysis details")?;
    Ok(Analysis {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        model: row.get("model"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        cost_usd: row.get("cost_usd"),
        is_current: row.get("is_current"),
        created_at: row.get("created_at"),
        details,
    })
}

fn comparison_from_row(row: &SqliteRow) -> Result<Comparison> {
    let ranking: String = row.get("ranking_json");
    Ok(Comparison {
        id: row.get("id"),
        user_query: row.get("user_query"),
        normalized_query: row.get("normalized_query"),
        technologies: json_list(row, "technologies_json")?,
        problem_domains: json_list(row, "problem_domains_json")?,
        architecture_patterns: json_list(row, "architecture_patterns_json")?,
        constraints: json_list(row, "constraints_json")?,
        search_queries: json_list(row, "search_queries_json")?,
        recommended_repo_full_name: row.get("recommended_repo_full_name"),
        recommendation_reason: row.get("recommendation_reason"),
        ranking: serde_json::from_str(&ranking).context("corrupt ranking payload")?,
        repos_compared: row.get("repos_compared"),
        model: row.get("model"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        cost_usd: row.get("cost_usd"),
        view_count: row.get("view_count"),
        created_at: row.get("created_at"),
    })
}

fn ledger_from_row(row: &SqliteRow) -> CostLedgerEntry {
    CostLedgerEntry {
        date: row.get("date"),
        model: row.get("model"),
        total_requests: row.get("total_requests"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        total_cost_usd: row.get("total_cost_usd"),
        updated_at: row.get("updated_at"),
    }
}

fn operation_from_row(row: &SqliteRow) -> Result<PendingOperation> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(PendingOperation {
        id: row.get("id"),
        kind: kind.parse()?,
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        subject: row.get("subject"),
        status: status.parse()?,
        pending_cost_usd: row.get("pending_cost_usd"),
        result_id: row.get("result_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_repository(
        &self,
        item: &SourceRepository,
        now: i64,
    ) -> Result<UpsertedRepository> {
        let mut tx = self.pool.begin().await?;

        let existed: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM repositories WHERE github_id = ?")
                .bind(item.github_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO repositories (github_id, node_id, full_name, name, owner, description,
                                      html_url, stars, forks, open_issues, language, topics_json,
                                      github_created_at, github_updated_at, github_pushed_at,
                                      archived, fetch_count, last_fetched_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(github_id) DO UPDATE SET
                node_id = excluded.node_id,
                full_name = excluded.full_name,
                name = excluded.name,
                owner = excluded.owner,
                description = excluded.description,
                html_url = excluded.html_url,
                stars = excluded.stars,
                forks = excluded.forks,
                open_issues = excluded.open_issues,
                language = excluded.language,
                topics_json = excluded.topics_json,
                github_created_at = excluded.github_created_at,
                github_updated_at = excluded.github_updated_at,
                github_pushed_at = excluded.github_pushed_at,
                archived = excluded.archived,
                fetch_count = repositories.fetch_count + 1,
                last_fetched_at = excluded.last_fetched_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.github_id)
        .bind(&item.node_id)
        .bind(&item.full_name)
        .bind(&item.name)
        .bind(&item.owner)
        .bind(&item.description)
        .bind(&item.html_url)
        .bind(item.stars)
        .bind(item.forks)
        .bind(item.open_issues)
        .bind(&item.language)
        .bind(to_json_list(&item.topics)?)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.pushed_at)
        .bind(item.archived)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert repository {}", item.full_name))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE github_id = ?",
            REPOSITORY_COLUMNS
        ))
        .bind(item.github_id)
        .fetch_one(&mut *tx)
        .await?;
        let repository = repository_from_row(&row)?;

        tx.commit().await?;

        Ok(UpsertedRepository {
            repository,
            outcome: if existed {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Created
            },
        })
    }

    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE id = ?",
            REPOSITORY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repository_from_row).transpose()
    }

    async fn find_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE full_name = ? COLLATE NOCASE",
            REPOSITORY_COLUMNS
        ))
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repository_from_row).transpose()
    }

    async fn repository_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn repositories_pending_analysis(&self, limit: i64) -> Result<Vec<Repository>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM repositories r
            WHERE NOT EXISTS (
                SELECT 1 FROM analyses a
                WHERE a.repository_id = r.id AND a.kind = 'basic' AND a.is_current = 1
            )
            ORDER BY r.stars DESC, r.id ASC
            LIMIT ?
            "#,
            REPOSITORY_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(repository_from_row).collect()
    }

    async fn set_repository_readme(
        &self,
        id: i64,
        content: &str,
        sha: &str,
        fetched_at: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repositories SET readme_content = ?, readme_sha = ?, readme_fetched_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(sha)
        .bind(fetched_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("repository {} not found", id);
        }
        Ok(())
    }

    async fn categories_by_type(&self, category_type: CategoryType) -> Result<Vec<Category>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM categories WHERE category_type = ? ORDER BY id",
            CATEGORY_COLUMNS
        ))
        .bind(category_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(category_from_row).collect()
    }

    async fn find_category_by_slug(
        &self,
        category_type: CategoryType,
        slug: &str,
    ) -> Result<Option<Category>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM categories WHERE category_type = ? AND slug = ?",
            CATEGORY_COLUMNS
        ))
        .bind(category_type.as_str())
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn insert_category(&self, category: &NewCategory, now: i64) -> Result<Category> {
        sqlx::query(
            r#"
            INSERT INTO categories (name, slug, category_type, description, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(category_type, slug) DO NOTHING
            "#,
        )
        .bind(&category.name)
        .bind(&category.slug)
        .bind(category.category_type.as_str())
        .bind(&category.description)
        .bind(category.embedding.as_deref().map(vec_to_blob))
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_category_by_slug(category.category_type, &category.slug)
            .await?
            .ok_or_else(|| anyhow!("category {} vanished after insert", category.slug))
    }

    async fn set_category_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE categories SET embedding = ? WHERE id = ?")
            .bind(vec_to_blob(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_category(
        &self,
        repository_id: i64,
        category_id: i64,
        confidence: f64,
        assigned_by: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_categories (repository_id, category_id, confidence, assigned_by)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(repository_id, category_id) DO UPDATE SET
                confidence = excluded.confidence,
                assigned_by = excluded.assigned_by
            "#,
        )
        .bind(repository_id)
        .bind(category_id)
        .bind(confidence)
        .bind(assigned_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn repository_categories(&self, repository_id: i64) -> Result<Vec<RepositoryCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.slug, c.category_type, c.description, c.embedding, c.created_at,
                   rc.confidence, rc.assigned_by
            FROM repository_categories rc
            JOIN categories c ON c.id = rc.category_id
            WHERE rc.repository_id = ?
            ORDER BY rc.confidence DESC, c.id
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RepositoryCategory {
                    category: category_from_row(row)?,
                    confidence: row.get("confidence"),
                    assigned_by: row.get("assigned_by"),
                })
            })
            .collect()
    }

    async fn insert_current_analysis(&self, analysis: &NewAnalysis, now: i64) -> Result<Analysis> {
        let kind = analysis.details.kind();
        let details = serde_json::to_string(&analysis.details)?;
        let mut tx = self.pool.begin().await?;

        let stamped = sqlx::query("UPDATE repositories SET last_analyzed_at = ? WHERE id = ?")
            .bind(now)
            .bind(analysis.repository_id)
            .execute(&mut *tx)
            .await?;
        if stamped.rows_affected() == 0 {
            bail!("repository {} not found", analysis.repository_id);
        }

        sqlx::query("UPDATE analyses SET is_current = 0 WHERE repository_id = ? AND kind = ?")
            .bind(analysis.repository_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query(
            r#"
            INSERT INTO analyses (repository_id, kind, model, input_tokens, output_tokens,
                                  cost_usd, is_current, details_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(analysis.repository_id)
        .bind(kind.as_str())
        .bind(&analysis.model)
        .bind(analysis.input_tokens)
        .bind(analysis.output_tokens)
        .bind(analysis.cost_usd)
        .bind(&details)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        Ok(Analysis {
            id,
            repository_id: analysis.repository_id,
            model: analysis.model.clone(),
            input_tokens: analysis.input_tokens,
            output_tokens: analysis.output_tokens,
            cost_usd: analysis.cost_usd,
            is_current: true,
            created_at: now,
            details: analysis.details.clone(),
        })
    }

    async fn current_analysis(
        &self,
        repository_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<Analysis>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analyses WHERE repository_id = ? AND kind = ? AND is_current = 1",
            ANALYSIS_COLUMNS
        ))
        .bind(repository_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(analysis_from_row).transpose()
    }

    async fn list_analyses(&self, repository_id: i64, kind: AnalysisKind) -> Result<Vec<Analysis>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analyses WHERE repository_id = ? AND kind = ? ORDER BY id",
            ANALYSIS_COLUMNS
        ))
        .bind(repository_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(analysis_from_row).collect()
    }

    async fn insert_comparison(
        &self,
        comparison: &NewComparison,
        entries: &[ComparisonEntry],
    ) -> Result<Comparison> {
        if comparison.cost_usd < 0.0 {
            bail!("comparison cost must be >= 0, got {}", comparison.cost_usd);
        }
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO comparisons (user_query, normalized_query, technologies_json,
                                     problem_domains_json, architecture_patterns_json,
                                     constraints_json, search_queries_json,
                                     recommended_repo_full_name, recommendation_reason,
                                     ranking_json, repos_compared, model, input_tokens,
                                     output_tokens, cost_usd, view_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&comparison.user_query)
        .bind(&comparison.normalized_query)
        .bind(to_json_list(&comparison.technologies)?)
        .bind(to_json_list(&comparison.problem_domains)?)
        .bind(to_json_list(&comparison.architecture_patterns)?)
        .bind(to_json_list(&comparison.constraints)?)
        .bind(to_json_list(&comparison.search_queries)?)
        .bind(&comparison.recommended_repo_full_name)
        .bind(&comparison.recommendation_reason)
        .bind(serde_json::to_string(&comparison.ranking)?)
        .bind(comparison.repos_compared)
        .bind(&comparison.model)
        .bind(comparison.input_tokens)
        .bind(comparison.output_tokens)
        .bind(comparison.cost_usd)
        .bind(comparison.created_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO comparison_repositories (comparison_id, repository_id,
                                                     repository_full_name, rank, score,
                                                     pros_json, cons_json, fit_reasoning)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(entry.repository_id)
            .bind(&entry.repository_full_name)
            .bind(entry.rank)
            .bind(entry.score)
            .bind(to_json_list(&entry.pros)?)
            .bind(to_json_list(&entry.cons)?)
            .bind(&entry.fit_reasoning)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_comparison(id)
            .await?
            .ok_or_else(|| anyhow!("comparison {} vanished after insert", id))
    }

    async fn get_comparison(&self, id: i64) -> Result<Option<Comparison>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM comparisons WHERE id = ?",
            COMPARISON_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(comparison_from_row).transpose()
    }

    async fn comparison_entries(&self, comparison_id: i64) -> Result<Vec<ComparisonEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT repository_id, repository_full_name, rank, score, pros_json, cons_json,
                   fit_reasoning
            FROM comparison_repositories
            WHERE comparison_id = ?
            ORDER BY rank ASC
            "#,
        )
        .bind(comparison_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ComparisonEntry {
                    repository_id: row.get("repository_id"),
                    repository_full_name: row.get("repository_full_name"),
                    rank: row.get("rank"),
                    score: row.get("score"),
                    pros: json_list(row, "pros_json")?,
                    cons: json_list(row, "cons_json")?,
                    fit_reasoning: row.get("fit_reasoning"),
                })
            })
            .collect()
    }

    async fn cached_queries_since(&self, since: i64) -> Result<Vec<CachedQuery>> {
        let rows = sqlx::query(
            "SELECT id, normalized_query, created_at FROM comparisons WHERE created_at >= ?",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| CachedQuery {
                comparison_id: row.get("id"),
                normalized_query: row.get("normalized_query"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn increment_view_count(&self, comparison_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE comparisons SET view_count = view_count + 1 WHERE id = ?")
            .bind(comparison_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("comparison {} not found", comparison_id);
        }
        Ok(())
    }

    async fn link_comparison_category(
        &self,
        comparison_id: i64,
        category_id: i64,
        confidence: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO comparison_categories (comparison_id, category_id, confidence)
            VALUES (?, ?, ?)
            ON CONFLICT(comparison_id, category_id) DO UPDATE SET confidence = excluded.confidence
            "#,
        )
        .bind(comparison_id)
        .bind(category_id)
        .bind(confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn comparison_categories(&self, comparison_id: i64) -> Result<Vec<ComparisonCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.slug, c.category_type, c.description, c.embedding, c.created_at,
                   cc.confidence
            FROM comparison_categories cc
            JOIN categories c ON c.id = cc.category_id
            WHERE cc.comparison_id = ?
            ORDER BY c.id
            "#,
        )
        .bind(comparison_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ComparisonCategory {
                    category: category_from_row(row)?,
                    confidence: row.get("confidence"),
                })
            })
            .collect()
    }

    async fn list_comparisons(&self, limit: i64) -> Result<Vec<Comparison>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM comparisons ORDER BY created_at DESC, id DESC LIMIT ?",
            COMPARISON_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(comparison_from_row).collect()
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
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO cost_ledger (date, model, total_requests, input_tokens, output_tokens,
                                     total_cost_usd, updated_at)
            VALUES (?, ?, 1, ?, ?, ?, ?)
            ON CONFLICT(date, model) DO UPDATE SET
                total_requests = cost_ledger.total_requests + 1,
                input_tokens = cost_ledger.input_tokens + excluded.input_tokens,
                output_tokens = cost_ledger.output_tokens + excluded.output_tokens,
                total_cost_usd = cost_ledger.total_cost_usd + excluded.total_cost_usd,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(date)
        .bind(model)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(cost_usd)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM cost_ledger WHERE date = ? AND model = ?")
            .bind(date)
            .bind(model)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ledger_from_row(&row))
    }

    async fn ledger_entries(&self, date: &str) -> Result<Vec<CostLedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM cost_ledger WHERE date = ? ORDER BY model")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(ledger_from_row).collect())
    }

    async fn try_reserve(&self, request: &ReservationRequest) -> Result<ReservationOutcome> {
        let limit = request.user_daily_limit.unwrap_or(i64::MAX);

        let inserted = sqlx::query(
            r#"
            INSERT INTO pending_operations (id, kind, session_id, user_id, subject, status,
                                            pending_cost_usd, created_at)
            SELECT ?, ?, ?, ?, ?, 'processing', ?, ?
            FROM (
                SELECT
                    (SELECT COALESCE(SUM(total_cost_usd), 0.0) FROM cost_ledger
                     WHERE date = ?) AS spent,
                    (SELECT COALESCE(SUM(pending_cost_usd), 0.0) FROM pending_operations
                     WHERE status = 'processing' AND created_at >= ?) AS pending,
                    (SELECT COUNT(*) FROM pending_operations
                     WHERE user_id = ? AND created_at >= ?) AS user_count
            ) AS totals
            WHERE totals.user_count < ?
              AND totals.spent + totals.pending < ?
              AND totals.spent + totals.pending + ? <= ?
            "#,
        )
        .bind(&request.id)
        .bind(request.kind.as_str())
        .bind(&request.session_id)
        .bind(&request.user_id)
        .bind(&request.subject)
        .bind(request.pending_cost_usd)
        .bind(request.now)
        .bind(&request.date)
        .bind(request.day_start)
        .bind(&request.user_id)
        .bind(request.day_start)
        .bind(limit)
        .bind(request.daily_budget_usd)
        .bind(request.pending_cost_usd)
        .bind(request.daily_budget_usd)
        .execute(&self.pool)
        .await
        .context("budget reservation failed")?;

        if inserted.rows_affected() == 1 {
            let operation = self
                .get_operation(&request.id)
                .await?
                .ok_or_else(|| anyhow!("reservation {} vanished after insert", request.id))?;
            return Ok(ReservationOutcome::Reserved(operation));
        }

        // Rejected: report the reason from a fresh read.
        if let Some(limit) = request.user_daily_limit {
            let count = self
                .user_operation_count_since(&request.user_id, request.day_start)
                .await?;
            if count >= limit {
                return Ok(ReservationOutcome::UserLimitReached { count, limit });
            }
        }
        Ok(ReservationOutcome::BudgetExhausted {
            spent_usd: self.total_cost_for_date(&request.date).await?,
            pending_usd: self.pending_cost_since(request.day_start).await?,
        })
    }

    async fn pending_cost_since(&self, since: i64) -> Result<f64> {
        let pending: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(pending_cost_usd), 0.0) FROM pending_operations WHERE status = 'processing' AND created_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }

    async fn user_operation_count_since(&self, user_id: &str, since: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_operations WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_operation(&self, id: &str) -> Result<Option<PendingOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pending_operations WHERE id = ?",
            OPERATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(operation_from_row).transpose()
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
        let result = sqlx::query(
            r#"
            UPDATE pending_operations
            SET status = ?, result_id = ?, error_message = ?, finished_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(result_id)
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
