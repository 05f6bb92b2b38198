//! Multi-query repository aggregation.
//!
//! # Algorithm
//!
//! 1. Clamp `limit` to `[1, aggregator.max_limit]`.
//! 2. Run each search query in order. Keep the first occurrence of every
//!    `github_id`; later duplicates (from the same or a later query) are
//!    dropped.
//! 3. Stable-sort the survivors by stars, descending.
//! 4. Upsert every survivor, so repeated fetches refresh rather than
//!    duplicate.
//! 5. The first `limit` become **top** and get a basic analysis plus
//!    categories, one at a time. The rest are **other** and stay
//!    unenriched. A repository whose analysis fails is logged and kept
//!    without one.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use repo_compare_core::models::{Analysis, Repository, RepositoryCategory, SourceRepository};
use repo_compare_core::store::Store;

use crate::analyzer::RepositoryAnalyzer;
use crate::config::AggregatorConfig;
use crate::progress::ProgressBroadcaster;
use crate::search_source::SourceSearch;

/// A repository ready to be ranked.
#[derive(Debug, Clone)]
pub struct PreparedRepository {
    pub repository: Repository,
    pub analysis: Option<Analysis>,
    pub categories: Vec<RepositoryCategory>,
    pub stars_per_day: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub top: Vec<PreparedRepository>,
    pub other: Vec<PreparedRepository>,
    /// Distinct repositories found across all queries.
    pub total_found: usize,
}

impl AggregateResult {
    pub fn is_empty(&self) -> bool {
        self.total_found == 0
    }
}

pub struct SourceAggregator {
    store: Arc<dyn Store>,
    source: Arc<dyn SourceSearch>,
    analyzer: Arc<RepositoryAnalyzer>,
    config: AggregatorConfig,
}

impl SourceAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn SourceSearch>,
        analyzer: Arc<RepositoryAnalyzer>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            source,
            analyzer,
            config,
        }
    }

    pub fn clamp_limit(&self, limit: usize) -> usize {
        limit.clamp(1, self.config.max_limit.max(1))
    }

    pub async fn fetch_and_prepare(
        &self,
        queries: &[String],
        limit: usize,
        now: i64,
        progress: Option<&ProgressBroadcaster>,
    ) -> Result<AggregateResult> {
        let limit = self.clamp_limit(limit);

        let mut found = Vec::new();
        for (i, query) in queries.iter().enumerate() {
            if let Some(p) = progress {
                p.broadcast_item(
                    "searching",
                    &format!("Searching for \"{}\"", query),
                    Some(20 + (20 * i / queries.len().max(1)) as u8),
                    i + 1,
                    queries.len(),
                );
            }
            let items = self
                .source
                .search(query, self.config.per_query_results)
                .await?;
            found.push(items);
        }

        let candidates = dedup_and_sort(found);
        let total_found = candidates.len();
        info!(queries = queries.len(), total_found, limit, "search results aggregated");
        if candidates.is_empty() {
            return Ok(AggregateResult::default());
        }

        let mut repositories = Vec::with_capacity(candidates.len());
        for item in &candidates {
            let upserted = self
                .store
                .upsert_repository(item, now)
                .await
                .with_context(|| format!("storing {}", item.full_name))?;
            repositories.push(upserted.repository);
        }

        let other_repos = repositories.split_off(limit.min(repositories.len()));
        let top_count = repositories.len();
        let mut top = Vec::with_capacity(top_count);
        for (i, repository) in repositories.into_iter().enumerate() {
            if let Some(p) = progress {
                p.broadcast_item(
                    "analyzing",
                    &format!("Analyzing {}", repository.full_name),
                    Some(40 + (30 * i / top_count.max(1)) as u8),
                    i + 1,
                    top_count,
                );
            }
            let stars_per_day = repository.stars_per_day(now);
            match self.analyzer.analyze_basic(&repository, now).await {
                Ok(run) => top.push(PreparedRepository {
                    repository,
                    analysis: Some(run.analysis),
                    categories: run.categories,
                    stars_per_day,
                }),
                Err(e) => {
                    warn!(
                        repo = %repository.full_name,
                        error = %format!("{:#}", e),
                        "analysis failed; keeping repository unenriched"
                    );
                    top.push(PreparedRepository {
                        repository,
                        analysis: None,
                        categories: Vec::new(),
                        stars_per_day,
                    });
                }
            }
        }

        let other = other_repos
            .into_iter()
            .map(|repository| PreparedRepository {
                stars_per_day: repository.stars_per_day(now),
                repository,
                analysis: None,
                categories: Vec::new(),
            })
            .collect();

        Ok(AggregateResult {
            top,
            other,
            total_found,
        })
    }
}

/// First occurrence of each `github_id` across all result lists, then a
/// stable sort by stars descending.
pub fn dedup_and_sort(results: Vec<Vec<SourceRepository>>) -> Vec<SourceRepository> {
    let mut seen = HashSet::new();
    let mut unique: Vec<SourceRepository> = results
        .into_iter()
        .flatten()
        .filter(|item| seen.insert(item.github_id))
        .collect();
    unique.sort_by(|a, b| b.stars.cmp(&a.stars));
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, stars: i64) -> SourceRepository {
        SourceRepository {
            github_id: id,
            node_id: format!("R_{}", id),
            full_name: format!("owner/repo{}", id),
            name: format!("repo{}", id),
            owner: "owner".into(),
            description: None,
            html_url: String::new(),
            stars,
            forks: 0,
            open_issues: 0,
            language: None,
            topics: vec![],
            created_at: None,
            updated_at: None,
            pushed_at: None,
            archived: false,
        }
    }

    #[test]
    fn duplicates_across_queries_are_dropped() {
        let merged = dedup_and_sort(vec![
            vec![item(1, 10), item(2, 50)],
            vec![item(2, 50), item(3, 30)],
        ]);
        let ids: Vec<i64> = merged.iter().map(|r| r.github_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn equal_stars_keep_first_seen_order() {
        let merged = dedup_and_sort(vec![vec![item(5, 7)], vec![item(4, 7), item(6, 7)]]);
        let ids: Vec<i64> = merged.iter().map(|r| r.github_id).collect();
        assert_eq!(ids, vec![5, 4, 6]);
    }
}
