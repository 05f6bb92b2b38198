//! Weighted relevance scoring of stored comparisons against a search term.
//!
//! # Algorithm
//!
//! 1. Expand the term through [`synonyms::expand`](crate::synonyms::expand).
//! 2. For every variant, score each candidate field:
//!    - **fuzzy**: trigram [`word_similarity`] of the variant inside the field;
//!    - **exact**: `1.0` if the field contains the variant, else `0.0`.
//! 3. `score = wq·query + wt·technologies + wp·problem_domains
//!    + wa·architecture_patterns + wc·category·confidence`.
//!    List fields use their best-matching item; the category term uses the
//!    best-matching linked category scaled by that link's confidence.
//! 4. A variant matches if any field clears the threshold (fuzzy) or
//!    contains the variant (exact). The candidate's score is the **maximum**
//!    over matching variants, so wider synonym coverage never double-counts.
//! 5. Results are sorted by score (desc), then `created_at` (desc).

use serde::Serialize;

use crate::similarity::word_similarity;
use crate::synonyms;

/// Field weights. Defaults are tuning values, not invariants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelevanceWeights {
    pub query: f64,
    pub technologies: f64,
    pub problem_domains: f64,
    pub architecture_patterns: f64,
    pub category: f64,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            query: 100.0,
            technologies: 50.0,
            problem_domains: 30.0,
            architecture_patterns: 20.0,
            category: 10.0,
        }
    }
}

/// Fuzzy (trigram similarity) or exact (substring) matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Fuzzy,
    Exact,
}

/// A category linked to a candidate. Missing confidence falls back to the
/// scorer's default.
#[derive(Debug, Clone)]
pub struct CategoryLink {
    pub name: String,
    pub confidence: Option<f64>,
}

/// The searchable projection of a stored comparison.
#[derive(Debug, Clone)]
pub struct ScoringCandidate {
    pub id: i64,
    pub query: String,
    pub technologies: Vec<String>,
    pub problem_domains: Vec<String>,
    pub architecture_patterns: Vec<String>,
    pub categories: Vec<CategoryLink>,
    pub created_at: i64,
}

/// A matched candidate and its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub id: i64,
    pub score: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    weights: RelevanceWeights,
    threshold: f64,
    default_confidence: f64,
}

impl RelevanceScorer {
    pub fn new(weights: RelevanceWeights, threshold: f64, default_confidence: f64) -> Self {
        Self {
            weights,
            threshold,
            default_confidence,
        }
    }

    /// Best score across all synonym variants of `term`, or `None` if no
    /// variant matches any field. A blank term matches nothing.
    pub fn score(&self, term: &str, candidate: &ScoringCandidate, mode: MatchMode) -> Option<f64> {
        if term.trim().is_empty() {
            return None;
        }
        synonyms::expand(term)
            .iter()
            .filter_map(|variant| self.score_variant(variant, candidate, mode))
            .fold(None, |best: Option<f64>, s| {
                Some(best.map_or(s, |b| b.max(s)))
            })
    }

    /// Score, filter, and order candidates.
    pub fn rank(
        &self,
        term: &str,
        candidates: &[ScoringCandidate],
        mode: MatchMode,
    ) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .filter_map(|c| {
                self.score(term, c, mode).map(|score| ScoredCandidate {
                    id: c.id,
                    score,
                    created_at: c.created_at,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        scored
    }

    fn score_variant(
        &self,
        variant: &str,
        candidate: &ScoringCandidate,
        mode: MatchMode,
    ) -> Option<f64> {
        let query = field_match(variant, &candidate.query, mode);
        let technologies = best_match(variant, &candidate.technologies, mode);
        let problem_domains = best_match(variant, &candidate.problem_domains, mode);
        let architecture = best_match(variant, &candidate.architecture_patterns, mode);

        let (category, confidence) = candidate
            .categories
            .iter()
            .map(|link| {
                (
                    field_match(variant, &link.name, mode),
                    link.confidence.unwrap_or(self.default_confidence),
                )
            })
            .fold((0.0f64, self.default_confidence), |best, cur| {
                if cur.0 > best.0 {
                    cur
                } else {
                    best
                }
            });

        let matched = [query, technologies, problem_domains, architecture, category]
            .iter()
            .any(|&s| match mode {
                MatchMode::Fuzzy => s >= self.threshold,
                MatchMode::Exact => s > 0.0,
            });
        if !matched {
            return None;
        }

        let w = &self.weights;
        Some(
            w.query * query
                + w.technologies * technologies
                + w.problem_domains * problem_domains
                + w.architecture_patterns * architecture
                + w.category * category * confidence,
        )
    }
}

fn field_match(variant: &str, field: &str, mode: MatchMode) -> f64 {
    match mode {
        MatchMode::Fuzzy => word_similarity(variant, field),
        MatchMode::Exact => {
            if field.to_lowercase().contains(variant) {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn best_match(variant: &str, items: &[String], mode: MatchMode) -> f64 {
    items
        .iter()
        .map(|item| field_match(variant, item, mode))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RelevanceScorer {
        RelevanceScorer::new(RelevanceWeights::default(), 0.45, 0.5)
    }

    fn candidate(id: i64, query: &str, techs: &[&str], created_at: i64) -> ScoringCandidate {
        ScoringCandidate {
            id,
            query: query.to_string(),
            technologies: techs.iter().map(|s| s.to_string()).collect(),
            problem_domains: vec![],
            architecture_patterns: vec![],
            categories: vec![],
            created_at,
        }
    }

    #[test]
    fn query_match_outweighs_technology_match() {
        let s = scorer();
        let by_query = candidate(1, "sidekiq alternatives", &[], 0);
        let by_tech = candidate(2, "job processing", &["sidekiq"], 0);
        let ranked = s.rank("sidekiq", &[by_query, by_tech], MatchMode::Fuzzy);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, 1);
    }

    #[test]
    fn unrelated_candidates_are_excluded() {
        let s = scorer();
        let c = candidate(1, "react state management", &["react"], 0);
        assert!(s.score("kubernetes", &c, MatchMode::Fuzzy).is_none());
        assert!(s.score("kubernetes", &c, MatchMode::Exact).is_none());
    }

    #[test]
    fn synonym_variant_matches() {
        let s = scorer();
        let c = candidate(1, "kubernetes operators in go", &[], 0);
        assert!(s.score("k8s", &c, MatchMode::Exact).is_some());
    }

    #[test]
    fn best_synonym_wins_not_sum() {
        let s = scorer();
        // Both "k8s" and "kubernetes" appear; a summing scorer would exceed
        // a single full query match.
        let c = candidate(1, "k8s kubernetes", &[], 0);
        let score = s.score("k8s", &c, MatchMode::Exact).unwrap();
        assert!((score - 100.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn exact_mode_is_binary() {
        let s = scorer();
        let c = candidate(1, "a sidekiq setup", &["Sidekiq"], 0);
        let score = s.score("sidekiq", &c, MatchMode::Exact).unwrap();
        assert!((score - 150.0).abs() < 1e-9);
    }

    #[test]
    fn blank_term_matches_nothing() {
        let s = scorer();
        let c = candidate(1, "a sidekiq setup", &["Sidekiq"], 0);
        assert!(s.score("  ", &c, MatchMode::Exact).is_none());
        assert!(s.score("", &c, MatchMode::Fuzzy).is_none());
    }

    #[test]
    fn category_uses_link_confidence_or_default() {
        let s = scorer();
        let mut c = candidate(1, "nothing here", &[], 0);
        c.categories = vec![CategoryLink {
            name: "Observability".into(),
            confidence: Some(0.9),
        }];
        let with_conf = s.score("observability", &c, MatchMode::Exact).unwrap();
        assert!((with_conf - 9.0).abs() < 1e-9);

        c.categories[0].confidence = None;
        let default_conf = s.score("observability", &c, MatchMode::Exact).unwrap();
        assert!((default_conf - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_recency() {
        let s = scorer();
        let older = candidate(1, "rails jobs", &[], 10);
        let newer = candidate(2, "rails jobs", &[], 20);
        let ranked = s.rank("rails", &[older, newer], MatchMode::Exact);
        assert_eq!(ranked[0].id, 2);
        assert_eq!(ranked[1].id, 1);
    }
}
