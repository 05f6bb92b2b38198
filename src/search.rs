//! Search over stored comparisons.
//!
//! Candidates are scored by [`RelevanceScorer`]: the term is expanded
//! through the synonym table and matched against each comparison's query,
//! technologies, problem domains, architecture patterns, and linked
//! categories. Results are ordered by score, then recency.

use anyhow::Result;
use serde::Serialize;

use repo_compare_core::models::Comparison;
use repo_compare_core::normalize::normalize_query;
use repo_compare_core::relevance::{CategoryLink, MatchMode, RelevanceScorer, ScoringCandidate};
use repo_compare_core::store::Store;

use crate::config::RelevanceConfig;

/// Upper bound on comparisons considered per search.
const CANDIDATE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub score: f64,
    pub comparison: Comparison,
}

pub async fn search_comparisons(
    store: &dyn Store,
    config: &RelevanceConfig,
    term: &str,
    mode: MatchMode,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let term = normalize_query(term);
    if term.is_empty() {
        return Ok(Vec::new());
    }

    let comparisons = store.list_comparisons(CANDIDATE_LIMIT).await?;
    let mut candidates = Vec::with_capacity(comparisons.len());
    for c in &comparisons {
        let categories = store
            .comparison_categories(c.id)
            .await?
            .into_iter()
            .map(|link| CategoryLink {
                name: link.category.name,
                confidence: link.confidence,
            })
            .collect();
        candidates.push(ScoringCandidate {
            id: c.id,
            query: c.normalized_query.clone(),
            technologies: c.technologies.clone(),
            problem_domains: c.problem_domains.clone(),
            architecture_patterns: c.architecture_patterns.clone(),
            categories,
            created_at: c.created_at,
        });
    }

    let scorer = RelevanceScorer::new(
        config.weights(),
        config.fuzzy_threshold,
        config.default_confidence,
    );
    let hits = scorer
        .rank(&term, &candidates, mode)
        .into_iter()
        .take(limit)
        .filter_map(|scored| {
            comparisons
                .iter()
                .find(|c| c.id == scored.id)
                .map(|c| SearchHit {
                    score: scored.score,
                    comparison: c.clone(),
                })
        })
        .collect();
    Ok(hits)
}

pub fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let c = &hit.comparison;
        let date = chrono::DateTime::from_timestamp(c.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("{}. [{:.2}] {}", i + 1, hit.score, c.user_query);
        println!("    created: {}", date);
        if !c.technologies.is_empty() {
            println!("    technologies: {}", c.technologies.join(", "));
        }
        if let Some(ref recommended) = c.recommended_repo_full_name {
            println!("    recommended: {}", recommended);
        }
        println!("    id: {}", c.id);
        println!();
    }
}
