//! Core data models shared by the pipeline, the stores, and the CLI.
//!
//! Timestamps are Unix seconds (`i64`), matching the SQLite schema. List
//! fields are plain `Vec<String>`; stores decide how to serialize them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: i64 = 86_400;

// ============ Categories ============

/// The four category namespaces. Slugs are unique within a type only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryType {
    Technology,
    ProblemDomain,
    ArchitecturePattern,
    Maturity,
}

impl CategoryType {
    pub const ALL: [CategoryType; 4] = [
        CategoryType::Technology,
        CategoryType::ProblemDomain,
        CategoryType::ArchitecturePattern,
        CategoryType::Maturity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Technology => "technology",
            CategoryType::ProblemDomain => "problem_domain",
            CategoryType::ArchitecturePattern => "architecture_pattern",
            CategoryType::Maturity => "maturity",
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "technology" => Ok(CategoryType::Technology),
            "problem_domain" => Ok(CategoryType::ProblemDomain),
            "architecture_pattern" => Ok(CategoryType::ArchitecturePattern),
            "maturity" => Ok(CategoryType::Maturity),
            other => bail!("Unknown category type: '{}'", other),
        }
    }
}

/// A canonical label that repositories and comparisons are linked to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub category_type: CategoryType,
    pub description: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// Data required to insert a new [`Category`].
#[derive(Debug, Clone)]
pub struct NewCategory {
    pub name: String,
    pub slug: String,
    pub category_type: CategoryType,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
}

/// A category attached to a repository, with the confidence of the assignment.
#[derive(Debug, Clone)]
pub struct RepositoryCategory {
    pub category: Category,
    pub confidence: f64,
    pub assigned_by: String,
}

/// A category attached to a comparison. Confidence may be unknown.
#[derive(Debug, Clone)]
pub struct ComparisonCategory {
    pub category: Category,
    pub confidence: Option<f64>,
}

// ============ Repositories ============

/// One item as returned by the external source search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRepository {
    pub github_id: i64,
    pub node_id: String,
    pub full_name: String,
    pub name: String,
    pub owner: String,
    pub description: Option<String>,
    pub html_url: String,
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub pushed_at: Option<i64>,
    pub archived: bool,
}

/// A persisted repository. Identity (`github_id`, `node_id`, `full_name`)
/// is stable; stats and cached content are refreshed on every fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub github_id: i64,
    pub node_id: String,
    pub full_name: String,
    pub name: String,
    pub owner: String,
    pub description: Option<String>,
    pub html_url: String,
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub github_created_at: Option<i64>,
    pub github_updated_at: Option<i64>,
    pub github_pushed_at: Option<i64>,
    pub archived: bool,
    #[serde(skip)]
    pub readme_content: Option<String>,
    pub readme_sha: Option<String>,
    pub readme_fetched_at: Option<i64>,
    pub fetch_count: i64,
    pub last_fetched_at: i64,
    pub last_analyzed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Repository {
    /// Whole days since the repository was created upstream (0 if unknown).
    pub fn age_days(&self, now: i64) -> i64 {
        self.github_created_at
            .map(|created| ((now - created) / SECONDS_PER_DAY).max(0))
            .unwrap_or(0)
    }

    /// Popularity velocity: `stars / max(age_days, 1)`.
    pub fn stars_per_day(&self, now: i64) -> f64 {
        stars_per_day(self.stars, self.age_days(now))
    }

    /// True when the repository changed upstream after its last analysis.
    pub fn pushed_since_analysis(&self) -> bool {
        match (self.last_analyzed_at, self.github_pushed_at) {
            (None, _) => true,
            (Some(analyzed), Some(pushed)) => pushed > analyzed,
            (Some(_), None) => false,
        }
    }
}

/// `stars / max(age_days, 1)`.
pub fn stars_per_day(stars: i64, age_days: i64) -> f64 {
    stars as f64 / age_days.max(1) as f64
}

/// Whether an upsert created a new row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct UpsertedRepository {
    pub repository: Repository,
    pub outcome: UpsertOutcome,
}

// ============ Analyses ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Basic,
    Deep,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Basic => "basic",
            AnalysisKind::Deep => "deep",
        }
    }
}

impl FromStr for AnalysisKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(AnalysisKind::Basic),
            "deep" => Ok(AnalysisKind::Deep),
            other => bail!("Unknown analysis kind: '{}'", other),
        }
    }
}

/// Fields every analysis carries, regardless of depth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicAnalysis {
    pub summary: String,
    #[serde(default)]
    pub use_cases: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub problem_domains: Vec<String>,
    #[serde(default)]
    pub architecture_patterns: Vec<String>,
    #[serde(default)]
    pub maturity: Option<String>,
}

/// A deep analysis extends the basic fields with a qualitative review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeepAnalysis {
    #[serde(flatten)]
    pub basic: BasicAnalysis,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub security_notes: Option<String>,
    #[serde(default)]
    pub maintenance_notes: Option<String>,
    #[serde(default)]
    pub readme_sha: Option<String>,
}

/// Variant payload of an [`Analysis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisDetails {
    Basic(BasicAnalysis),
    Deep(DeepAnalysis),
}

impl AnalysisDetails {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            AnalysisDetails::Basic(_) => AnalysisKind::Basic,
            AnalysisDetails::Deep(_) => AnalysisKind::Deep,
        }
    }

    /// The basic fields shared by both variants.
    pub fn basic(&self) -> &BasicAnalysis {
        match self {
            AnalysisDetails::Basic(b) => b,
            AnalysisDetails::Deep(d) => &d.basic,
        }
    }
}

/// A persisted analysis of a repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub id: i64,
    pub repository_id: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub is_current: bool,
    pub created_at: i64,
    pub details: AnalysisDetails,
}

impl Analysis {
    pub fn kind(&self) -> AnalysisKind {
        self.details.kind()
    }
}

/// Data required to record a new analysis.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub repository_id: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub details: AnalysisDetails,
}

// ============ Comparisons ============

/// A persisted comparison. Immutable once created apart from `view_count`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub id: i64,
    pub user_query: String,
    pub normalized_query: String,
    pub technologies: Vec<String>,
    pub problem_domains: Vec<String>,
    pub architecture_patterns: Vec<String>,
    pub constraints: Vec<String>,
    pub search_queries: Vec<String>,
    pub recommended_repo_full_name: Option<String>,
    pub recommendation_reason: Option<String>,
    pub ranking: serde_json::Value,
    pub repos_compared: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub view_count: i64,
    pub created_at: i64,
}

/// Data required to insert a new [`Comparison`].
#[derive(Debug, Clone)]
pub struct NewComparison {
    pub user_query: String,
    pub normalized_query: String,
    pub technologies: Vec<String>,
    pub problem_domains: Vec<String>,
    pub architecture_patterns: Vec<String>,
    pub constraints: Vec<String>,
    pub search_queries: Vec<String>,
    pub recommended_repo_full_name: Option<String>,
    pub recommendation_reason: Option<String>,
    pub ranking: serde_json::Value,
    pub repos_compared: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub created_at: i64,
}

/// One ranked repository inside a comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonEntry {
    pub repository_id: i64,
    pub repository_full_name: String,
    pub rank: i64,
    pub score: f64,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub fit_reasoning: String,
}

/// The slice of a comparison needed for cache lookups.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub comparison_id: i64,
    pub normalized_query: String,
    pub created_at: i64,
}

// ============ Cost ledger ============

/// Running totals for one `(date, model)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLedgerEntry {
    pub date: String,
    pub model: String,
    pub total_requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
    pub updated_at: i64,
}

// ============ Pending operations ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Comparison,
    Analysis,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Comparison => "comparison",
            OperationKind::Analysis => "analysis",
        }
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "comparison" => Ok(OperationKind::Comparison),
            "analysis" => Ok(OperationKind::Analysis),
            other => bail!("Unknown operation kind: '{}'", other),
        }
    }
}

/// `processing → completed | failed`. Both end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Processing)
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => bail!("Unknown operation status: '{}'", other),
        }
    }
}

/// A session-scoped long-running operation holding a budget reservation
/// while it is `processing`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: String,
    pub kind: OperationKind,
    pub session_id: String,
    pub user_id: String,
    pub subject: String,
    pub status: OperationStatus,
    pub pending_cost_usd: f64,
    pub result_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Everything a store needs to decide and record a reservation atomically.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub id: String,
    pub kind: OperationKind,
    pub session_id: String,
    pub user_id: String,
    pub subject: String,
    pub pending_cost_usd: f64,
    pub now: i64,
    /// Ledger date (`YYYY-MM-DD`) whose actual cost counts against the budget.
    pub date: String,
    /// Start of the budget day; reservations created before it are ignored.
    pub day_start: i64,
    pub daily_budget_usd: f64,
    /// `None` exempts the user from the per-user cap.
    pub user_daily_limit: Option<i64>,
}

/// Result of a reservation attempt.
#[derive(Debug, Clone)]
pub enum ReservationOutcome {
    Reserved(PendingOperation),
    BudgetExhausted { spent_usd: f64, pending_usd: f64 },
    UserLimitReached { count: i64, limit: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(stars: i64, created: Option<i64>) -> Repository {
        Repository {
            id: 1,
            github_id: 1,
            node_id: "n".into(),
            full_name: "o/r".into(),
            name: "r".into(),
            owner: "o".into(),
            description: None,
            html_url: String::new(),
            stars,
            forks: 0,
            open_issues: 0,
            language: None,
            topics: vec![],
            github_created_at: created,
            github_updated_at: None,
            github_pushed_at: None,
            archived: false,
            readme_content: None,
            readme_sha: None,
            readme_fetched_at: None,
            fetch_count: 1,
            last_fetched_at: 0,
            last_analyzed_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn stars_per_day_floors_age_at_one() {
        assert_eq!(stars_per_day(50, 0), 50.0);
        assert_eq!(stars_per_day(50, 10), 5.0);
    }

    #[test]
    fn repository_age_and_velocity() {
        let now = 100 * SECONDS_PER_DAY;
        let r = repo(1000, Some(0));
        assert_eq!(r.age_days(now), 100);
        assert!((r.stars_per_day(now) - 10.0).abs() < 1e-9);
        assert_eq!(repo(7, None).stars_per_day(now), 7.0);
    }

    #[test]
    fn category_type_round_trips_through_str() {
        for ty in CategoryType::ALL {
            assert_eq!(ty.as_str().parse::<CategoryType>().unwrap(), ty);
        }
        assert!("framework".parse::<CategoryType>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OperationStatus::Processing.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
    }

    #[test]
    fn pushed_since_analysis() {
        let mut r = repo(1, None);
        assert!(r.pushed_since_analysis());
        r.last_analyzed_at = Some(10);
        r.github_pushed_at = Some(5);
        assert!(!r.pushed_since_analysis());
        r.github_pushed_at = Some(20);
        assert!(r.pushed_since_analysis());
    }
}
