//! AI ranking of prepared repositories into a persisted comparison.
//!
//! The model sees repository stats, quality signals, and analysis
//! summaries and returns a ranked list with pros, cons, and fit reasoning.
//! Its reply is treated as untrusted: markup, script payloads, and links
//! outside GitHub reject the whole reply, and entries naming repositories
//! that were not offered are dropped.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use repo_compare_core::category::CategoryResolver;
use repo_compare_core::models::{CategoryType, Comparison, ComparisonEntry, NewComparison};
use repo_compare_core::normalize::normalize_query;
use repo_compare_core::store::Store;

use crate::aggregator::PreparedRepository;
use crate::completion::TextCompletionService;
use crate::error::UpstreamError;
use crate::interpreter::ParsedQuery;
use crate::ledger::CostLedger;

const SERVICE: &str = "comparison ranking";
const ALLOWED_URL_PREFIX: &str = "https://github.com/";
const STOPWORDS: &[&str] = &[
    "and", "for", "the", "with", "from", "into", "that", "this", "using", "based", "library",
    "libraries", "tool", "tools", "framework",
];

const SYSTEM_PROMPT: &str = "You compare open-source repositories for a developer. \
Rank only the repositories provided. Respond with a JSON object with keys: \
\"recommended\" (full_name of the best fit), \"recommendation_reason\" (two sentences), \
\"ranking\" (array ordered best first; each item has \"full_name\", \"score\" (0-100), \
\"pros\" (array), \"cons\" (array), \"fit_reasoning\" (one sentence)). \
Use plain text only: no HTML, no markdown links.";

#[derive(Debug, Clone, Deserialize)]
struct RankingReply {
    #[serde(default)]
    recommended: Option<String>,
    #[serde(default)]
    recommendation_reason: Option<String>,
    #[serde(default)]
    ranking: Vec<RankedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RankedItem {
    full_name: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    pros: Vec<String>,
    #[serde(default)]
    cons: Vec<String>,
    #[serde(default)]
    fit_reasoning: String,
}

/// Rejects replies carrying markup or off-site links.
struct ReplyGuard {
    script: Regex,
    url: Regex,
}

impl ReplyGuard {
    fn new() -> Result<Self> {
        Ok(Self {
            script: Regex::new(
                r"(?i)</?(script|iframe|object|embed|img)\b|<a\s+href|</a\s*>|javascript:|data:text/html|\bon(load|error|click|mouseover)\s*=",
            )?,
            url: Regex::new(r#"(?i)\b(?:https?|ftp)://[^\s"'<>)\]]+"#)?,
        })
    }

    fn check(&self, reply: &serde_json::Value) -> Result<()> {
        let text = reply.to_string();
        if self.script.is_match(&text) {
            return Err(UpstreamError::Malformed {
                service: SERVICE,
                message: "reply contains markup or script content".to_string(),
            }
            .into());
        }
        if let Some(url) = self
            .url
            .find_iter(&text)
            .map(|m| m.as_str())
            .find(|u| !u.to_lowercase().starts_with(ALLOWED_URL_PREFIX))
        {
            return Err(UpstreamError::Malformed {
                service: SERVICE,
                message: format!("reply links outside GitHub: {}", url),
            }
            .into());
        }
        Ok(())
    }
}

pub struct ComparisonRanker {
    store: Arc<dyn Store>,
    completion: Arc<dyn TextCompletionService>,
    resolver: Arc<CategoryResolver>,
    ledger: CostLedger,
    model: String,
    guard: ReplyGuard,
}

impl ComparisonRanker {
    pub fn new(
        store: Arc<dyn Store>,
        completion: Arc<dyn TextCompletionService>,
        resolver: Arc<CategoryResolver>,
        ledger: CostLedger,
        model: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            completion,
            resolver,
            ledger,
            model: model.into(),
            guard: ReplyGuard::new()?,
        })
    }

    pub async fn compare(
        &self,
        user_query: &str,
        parsed: &ParsedQuery,
        repositories: &[PreparedRepository],
        now: i64,
    ) -> Result<Comparison> {
        if repositories.is_empty() {
            bail!("nothing to compare");
        }

        let user_prompt = build_prompt(user_query, parsed, repositories);
        let completion = self
            .completion
            .complete(SYSTEM_PROMPT, &user_prompt, &self.model)
            .await
            .context("ranking repositories")?;

        self.guard.check(&completion.content)?;
        let reply: RankingReply =
            serde_json::from_value(completion.content).map_err(|e| UpstreamError::Malformed {
                service: SERVICE,
                message: e.to_string(),
            })?;

        let entries = build_entries(&reply.ranking, repositories);
        if entries.is_empty() {
            return Err(UpstreamError::Malformed {
                service: SERVICE,
                message: "ranking names none of the offered repositories".to_string(),
            }
            .into());
        }

        let offered: HashSet<&str> = repositories
            .iter()
            .map(|p| p.repository.full_name.as_str())
            .collect();
        let recommended = reply
            .recommended
            .filter(|name| offered.contains(name.as_str()))
            .or_else(|| entries.first().map(|e| e.repository_full_name.clone()));

        let cost = self
            .ledger
            .record(&completion.model, completion.usage, now)
            .await?;

        let ranking = serde_json::to_value(
            entries
                .iter()
                .map(|e| {
                    json!({
                        "rank": e.rank,
                        "full_name": e.repository_full_name,
                        "score": e.score,
                    })
                })
                .collect::<Vec<_>>(),
        )?;

        let comparison = self
            .store
            .insert_comparison(
                &NewComparison {
                    user_query: user_query.trim().to_string(),
                    normalized_query: normalize_query(user_query),
                    technologies: parsed.tech_stack.clone(),
                    problem_domains: if parsed.problem_domain.trim().is_empty() {
                        Vec::new()
                    } else {
                        vec![parsed.problem_domain.trim().to_string()]
                    },
                    architecture_patterns: parsed.architecture_patterns.clone(),
                    constraints: parsed.constraints.clone(),
                    search_queries: parsed.search_queries.clone(),
                    recommended_repo_full_name: recommended,
                    recommendation_reason: reply.recommendation_reason,
                    ranking,
                    repos_compared: entries.len() as i64,
                    model: completion.model,
                    input_tokens: completion.usage.input_tokens,
                    output_tokens: completion.usage.output_tokens,
                    cost_usd: cost,
                    created_at: now,
                },
                &entries,
            )
            .await?;

        self.link_categories(comparison.id, &parsed.problem_domain, now)
            .await;
        info!(
            comparison = comparison.id,
            repos = comparison.repos_compared,
            cost_usd = cost,
            "comparison stored"
        );
        Ok(comparison)
    }

    /// Link problem-domain categories whose names share words with the
    /// parsed problem domain; create one when nothing overlaps. Failures
    /// are logged, the comparison stands either way.
    async fn link_categories(&self, comparison_id: i64, problem_domain: &str, now: i64) {
        let words = content_words(problem_domain);
        if words.is_empty() {
            return;
        }

        let existing = match self.store.categories_by_type(CategoryType::ProblemDomain).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not load problem-domain categories");
                return;
            }
        };

        let mut linked = 0;
        for category in &existing {
            let category_words = content_words(&category.name);
            if category_words.is_empty() {
                continue;
            }
            let overlap = category_words.intersection(&words).count();
            if overlap == 0 {
                continue;
            }
            let confidence = overlap as f64 / category_words.len() as f64;
            match self
                .store
                .link_comparison_category(comparison_id, category.id, Some(confidence))
                .await
            {
                Ok(()) => linked += 1,
                Err(e) => warn!(category = %category.name, error = %e, "category link failed"),
            }
        }

        if linked == 0 {
            match self
                .resolver
                .resolve(problem_domain, CategoryType::ProblemDomain, now)
                .await
            {
                Ok(resolution) => {
                    if let Err(e) = self
                        .store
                        .link_comparison_category(
                            comparison_id,
                            resolution.category.id,
                            Some(resolution.score),
                        )
                        .await
                    {
                        warn!(error = %e, "category link failed");
                    }
                }
                Err(e) => warn!(problem_domain, error = %e, "problem domain not categorized"),
            }
        }
        debug!(comparison = comparison_id, linked, "comparison categories linked");
    }
}

fn build_prompt(user_query: &str, parsed: &ParsedQuery, repositories: &[PreparedRepository]) -> String {
    let repos: Vec<serde_json::Value> = repositories
        .iter()
        .map(|p| {
            let r = &p.repository;
            let basic = p.analysis.as_ref().map(|a| a.details.basic());
            json!({
                "full_name": r.full_name,
                "description": r.description,
                "language": r.language,
                "stars": r.stars,
                "forks": r.forks,
                "open_issues": r.open_issues,
                "stars_per_day": (p.stars_per_day * 100.0).round() / 100.0,
                "archived": r.archived,
                "summary": basic.map(|b| b.summary.clone()),
                "use_cases": basic.map(|b| b.use_cases.clone()).unwrap_or_default(),
                "maturity": basic.and_then(|b| b.maturity.clone()),
                "categories": p.categories.iter().map(|c| c.category.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();

    format!(
        "Request: \"{}\"\nTechnologies: {}\nProblem domain: {}\nConstraints: {}\n\nRepositories:\n{}",
        user_query.trim(),
        parsed.tech_stack.join(", "),
        parsed.problem_domain,
        parsed.constraints.join("; "),
        serde_json::to_string_pretty(&repos).unwrap_or_default()
    )
}

/// Keep ranked items that name an offered repository, once each, in the
/// model's order.
fn build_entries(ranking: &[RankedItem], repositories: &[PreparedRepository]) -> Vec<ComparisonEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for item in ranking {
        let Some(prepared) = repositories
            .iter()
            .find(|p| p.repository.full_name.eq_ignore_ascii_case(item.full_name.trim()))
        else {
            warn!(full_name = %item.full_name, "ranking names a repository that was not offered");
            continue;
        };
        if !seen.insert(prepared.repository.id) {
            continue;
        }
        entries.push(ComparisonEntry {
            repository_id: prepared.repository.id,
            repository_full_name: prepared.repository.full_name.clone(),
            rank: entries.len() as i64 + 1,
            score: item.score.clamp(0.0, 100.0),
            pros: item.pros.clone(),
            cons: item.cons.clone(),
            fit_reasoning: item.fit_reasoning.clone(),
        });
    }
    entries
}

fn content_words(text: &str) -> HashSet<String> {
    normalize_query(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}
