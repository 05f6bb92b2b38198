//! Idempotent schema creation (`rcmp init`).

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        github_id INTEGER NOT NULL UNIQUE,
        node_id TEXT NOT NULL UNIQUE,
        full_name TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        owner TEXT NOT NULL,
        description TEXT,
        html_url TEXT NOT NULL,
        stars INTEGER NOT NULL DEFAULT 0,
        forks INTEGER NOT NULL DEFAULT 0,
        open_issues INTEGER NOT NULL DEFAULT 0,
        language TEXT,
        topics_json TEXT NOT NULL DEFAULT '[]',
        github_created_at INTEGER,
        github_updated_at INTEGER,
        github_pushed_at INTEGER,
        archived INTEGER NOT NULL DEFAULT 0,
        readme_content TEXT,
        readme_sha TEXT,
        readme_fetched_at INTEGER,
        fetch_count INTEGER NOT NULL DEFAULT 1,
        last_fetched_at INTEGER NOT NULL,
        last_analyzed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        slug TEXT NOT NULL,
        category_type TEXT NOT NULL,
        description TEXT NOT NULL,
        embedding BLOB,
        created_at INTEGER NOT NULL,
        UNIQUE(category_type, slug)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repository_categories (
        repository_id INTEGER NOT NULL,
        category_id INTEGER NOT NULL,
        confidence REAL NOT NULL,
        assigned_by TEXT NOT NULL,
        PRIMARY KEY (repository_id, category_id),
        FOREIGN KEY (repository_id) REFERENCES repositories(id),
        FOREIGN KEY (category_id) REFERENCES categories(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        is_current INTEGER NOT NULL,
        details_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (repository_id) REFERENCES repositories(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comparisons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_query TEXT NOT NULL,
        normalized_query TEXT NOT NULL,
        technologies_json TEXT NOT NULL DEFAULT '[]',
        problem_domains_json TEXT NOT NULL DEFAULT '[]',
        architecture_patterns_json TEXT NOT NULL DEFAULT '[]',
        constraints_json TEXT NOT NULL DEFAULT '[]',
        search_queries_json TEXT NOT NULL DEFAULT '[]',
        recommended_repo_full_name TEXT,
        recommendation_reason TEXT,
        ranking_json TEXT NOT NULL,
        repos_compared INTEGER NOT NULL,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cost_usd REAL NOT NULL CHECK (cost_usd >= 0),
        view_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comparison_repositories (
        comparison_id INTEGER NOT NULL,
        repository_id INTEGER NOT NULL,
        repository_full_name TEXT NOT NULL,
        rank INTEGER NOT NULL,
        score REAL NOT NULL,
        pros_json TEXT NOT NULL DEFAULT '[]',
        cons_json TEXT NOT NULL DEFAULT '[]',
        fit_reasoning TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (comparison_id, repository_id),
        FOREIGN KEY (comparison_id) REFERENCES comparisons(id),
        FOREIGN KEY (repository_id) REFERENCES repositories(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comparison_categories (
        comparison_id INTEGER NOT NULL,
        category_id INTEGER NOT NULL,
        confidence REAL,
        PRIMARY KEY (comparison_id, category_id),
        FOREIGN KEY (comparison_id) REFERENCES comparisons(id),
        FOREIGN KEY (category_id) REFERENCES categories(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cost_ledger (
        date TEXT NOT NULL,
        model TEXT NOT NULL,
        total_requests INTEGER NOT NULL DEFAULT 0,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        total_cost_usd REAL NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (date, model)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pending_operations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        session_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        status TEXT NOT NULL,
        pending_cost_usd REAL NOT NULL DEFAULT 0,
        result_id INTEGER,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        finished_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_analyses_repo_kind ON analyses(repository_id, kind, is_current)",
    "CREATE INDEX IF NOT EXISTS idx_comparisons_created_at ON comparisons(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_stars ON repositories(stars DESC)",
    "CREATE INDEX IF NOT EXISTS idx_pending_operations_status ON pending_operations(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_pending_operations_user ON pending_operations(user_id, created_at)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed: {}", statement.trim()))?;
    }
    Ok(())
}
