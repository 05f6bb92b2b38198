//! Configuration parsing and validation.
//!
//! repo-compare is configured from a single TOML file (default
//! `config/rcmp.toml`). Every section except `[db]` has defaults, so a
//! minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/rcmp.sqlite"
//! ```
//!
//! The parsed [`Config`] is validated once by [`load_config`] and then
//! shared read-only (usually behind an `Arc`) by every component. API keys
//! are the only values read from the environment, and only when a client
//! is constructed.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use repo_compare_core::category::ResolverThresholds;
use repo_compare_core::pricing;
use repo_compare_core::relevance::RelevanceWeights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub categories: CategoriesConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Fuzzy reuse of earlier comparisons.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_cache_threshold")]
    pub similarity_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            similarity_threshold: default_cache_threshold(),
        }
    }
}

fn default_ttl_hours() -> i64 {
    168
}
fn default_cache_threshold() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelevanceConfig {
    #[serde(default = "default_query_weight")]
    pub query_weight: f64,
    #[serde(default = "default_technologies_weight")]
    pub technologies_weight: f64,
    #[serde(default = "default_problem_domains_weight")]
    pub problem_domains_weight: f64,
    #[serde(default = "default_architecture_patterns_weight")]
    pub architecture_patterns_weight: f64,
    #[serde(default = "default_category_weight")]
    pub category_weight: f64,
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            query_weight: default_query_weight(),
            technologies_weight: default_technologies_weight(),
            problem_domains_weight: default_problem_domains_weight(),
            architecture_patterns_weight: default_architecture_patterns_weight(),
            category_weight: default_category_weight(),
            fuzzy_threshold: default_fuzzy_threshold(),
            default_confidence: default_confidence(),
        }
    }
}

impl RelevanceConfig {
    pub fn weights(&self) -> RelevanceWeights {
        RelevanceWeights {
            query: self.query_weight,
            technologies: self.technologies_weight,
            problem_domains: self.problem_domains_weight,
            architecture_patterns: self.architecture_patterns_weight,
            category: self.category_weight,
        }
    }
}

fn default_query_weight() -> f64 {
    100.0
}
fn default_technologies_weight() -> f64 {
    50.0
}
fn default_problem_domains_weight() -> f64 {
    30.0
}
fn default_architecture_patterns_weight() -> f64 {
    20.0
}
fn default_category_weight() -> f64 {
    10.0
}
fn default_fuzzy_threshold() -> f64 {
    0.45
}
fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoriesConfig {
    #[serde(default = "default_lexical_threshold")]
    pub lexical_threshold: f64,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            lexical_threshold: default_lexical_threshold(),
            semantic_threshold: default_semantic_threshold(),
        }
    }
}

impl CategoriesConfig {
    pub fn thresholds(&self) -> ResolverThresholds {
        ResolverThresholds {
            lexical: self.lexical_threshold,
            semantic: self.semantic_threshold,
        }
    }
}

fn default_lexical_threshold() -> f64 {
    0.55
}
fn default_semantic_threshold() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_per_query_results")]
    pub per_query_results: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            per_query_results: default_per_query_results(),
        }
    }
}

fn default_limit() -> usize {
    5
}
fn default_max_limit() -> usize {
    10
}
fn default_per_query_results() -> usize {
    10
}

/// Chat-completion backend.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_openai_base_url(),
            chat_model: default_chat_model(),
            timeout_secs: default_llm_timeout_secs(),
            max_query_length: default_max_query_length(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_max_query_length() -> usize {
    500
}

/// Embedding backend used by the category resolver's semantic layer.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: default_openai_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Repository search service.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_source_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_source_base_url() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    #[serde(default = "default_per_user_daily_limit")]
    pub per_user_daily_limit: i64,
    #[serde(default)]
    pub admin_user_ids: Vec<String>,
    #[serde(default = "default_comparison_reservation_usd")]
    pub comparison_reservation_usd: f64,
    #[serde(default = "default_analysis_reservation_usd")]
    pub analysis_reservation_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: default_daily_budget_usd(),
            per_user_daily_limit: default_per_user_daily_limit(),
            admin_user_ids: Vec::new(),
            comparison_reservation_usd: default_comparison_reservation_usd(),
            analysis_reservation_usd: default_analysis_reservation_usd(),
        }
    }
}

impl BudgetConfig {
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_user_ids.iter().any(|id| id == user_id)
    }

    /// Per-user daily cap, or `None` for admins.
    pub fn user_limit_for(&self, user_id: &str) -> Option<i64> {
        if self.is_admin(user_id) {
            None
        } else {
            Some(self.per_user_daily_limit)
        }
    }
}

fn default_daily_budget_usd() -> f64 {
    5.0
}
fn default_per_user_daily_limit() -> i64 {
    10
}
fn default_comparison_reservation_usd() -> f64 {
    0.05
}
fn default_analysis_reservation_usd() -> f64 {
    0.10
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Pause between accepting a job and its first progress event.
    #[serde(default = "default_subscriber_grace_ms")]
    pub subscriber_grace_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            subscriber_grace_ms: default_subscriber_grace_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_subscriber_grace_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_items")]
    pub max_items: usize,
    #[serde(default = "default_cost_ceiling_usd")]
    pub cost_ceiling_usd: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: default_batch_max_items(),
            cost_ceiling_usd: default_cost_ceiling_usd(),
        }
    }
}

fn default_batch_max_items() -> usize {
    20
}
fn default_cost_ceiling_usd() -> f64 {
    0.50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_days_ago")]
    pub days_ago: i64,
    #[serde(default = "default_min_stars")]
    pub min_stars: i64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            days_ago: default_days_ago(),
            min_stars: default_min_stars(),
            page_size: default_page_size(),
        }
    }
}

fn default_days_ago() -> i64 {
    7
}
fn default_min_stars() -> i64 {
    100
}
fn default_page_size() -> usize {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let unit_interval = [
        ("cache.similarity_threshold", config.cache.similarity_threshold),
        ("relevance.fuzzy_threshold", config.relevance.fuzzy_threshold),
        ("relevance.default_confidence", config.relevance.default_confidence),
        ("categories.lexical_threshold", config.categories.lexical_threshold),
        ("categories.semantic_threshold", config.categories.semantic_threshold),
    ];
    for (key, value) in unit_interval {
        if !(0.0..=1.0).contains(&value) {
            bail!("{} must be in [0.0, 1.0]", key);
        }
    }

    if config.cache.ttl_hours < 1 {
        bail!("cache.ttl_hours must be >= 1");
    }

    // Validate aggregator
    if config.aggregator.max_limit < 1 || config.aggregator.default_limit < 1 {
        bail!("aggregator.default_limit and aggregator.max_limit must be >= 1");
    }
    if config.aggregator.default_limit > config.aggregator.max_limit {
        bail!("aggregator.default_limit must not exceed aggregator.max_limit");
    }
    if config.aggregator.per_query_results < 1 {
        bail!("aggregator.per_query_results must be >= 1");
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    pricing::ensure_supported(&config.llm.chat_model)
        .with_context(|| "llm.chat_model is not a priced model")?;
    if config.llm.max_query_length < 1 {
        bail!("llm.max_query_length must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate budget
    if config.budget.daily_budget_usd < 0.0 {
        bail!("budget.daily_budget_usd must be >= 0");
    }
    if config.budget.per_user_daily_limit < 1 {
        bail!("budget.per_user_daily_limit must be >= 1");
    }
    if config.budget.comparison_reservation_usd < 0.0
        || config.budget.analysis_reservation_usd < 0.0
    {
        bail!("budget reservations must be >= 0");
    }

    // Validate jobs
    if config.jobs.workers < 1 {
        bail!("jobs.workers must be >= 1");
    }
    if config.jobs.max_attempts < 1 {
        bail!("jobs.max_attempts must be >= 1");
    }

    if config.batch.max_items < 1 {
        bail!("batch.max_items must be >= 1");
    }
    if config.batch.cost_ceiling_usd < 0.0 {
        bail!("batch.cost_ceiling_usd must be >= 0");
    }

    Ok(config)
}
