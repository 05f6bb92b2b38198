//! Repository search service.
//!
//! [`SourceSearch`] is the narrow interface the aggregator, analyzer, and
//! trending sync consume. [`GitHubSearch`] implements it against the GitHub
//! REST search API; an optional `GITHUB_TOKEN` raises the rate limit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use repo_compare_core::models::SourceRepository;

use crate::config::SourceConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "github";
const USER_AGENT: &str = concat!("repo-compare/", env!("CARGO_PKG_VERSION"));

/// README text plus a content hash used to detect changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Readme {
    pub content: String,
    pub sha: String,
}

impl Readme {
    pub fn new(content: String) -> Self {
        let sha = hex::encode(Sha256::digest(content.as_bytes()));
        Self { content, sha }
    }
}

#[async_trait]
pub trait SourceSearch: Send + Sync {
    /// Repositories matching `query`, best match first.
    async fn search(&self, query: &str, page_size: usize) -> Result<Vec<SourceRepository>>;

    /// Repositories created in the last `days_ago` days with at least
    /// `min_stars` stars, most-starred first.
    async fn search_trending(
        &self,
        days_ago: i64,
        min_stars: i64,
        page_size: usize,
    ) -> Result<Vec<SourceRepository>>;

    /// The repository README, or `None` if it has none.
    async fn fetch_readme(&self, full_name: &str) -> Result<Option<Readme>>;
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<GitHubRepo>,
}

#[derive(Deserialize)]
struct GitHubOwner {
    login: String,
}

#[derive(Deserialize)]
struct GitHubRepo {
    id: i64,
    node_id: String,
    full_name: String,
    name: String,
    owner: GitHubOwner,
    description: Option<String>,
    html_url: String,
    #[serde(default)]
    stargazers_count: i64,
    #[serde(default)]
    forks_count: i64,
    #[serde(default)]
    open_issues_count: i64,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    pushed_at: Option<String>,
    #[serde(default)]
    archived: bool,
}

fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
}

impl From<GitHubRepo> for SourceRepository {
    fn from(repo: GitHubRepo) -> Self {
        SourceRepository {
            github_id: repo.id,
            node_id: repo.node_id,
            full_name: repo.full_name,
            name: repo.name,
            owner: repo.owner.login,
            description: repo.description,
            html_url: repo.html_url,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            open_issues: repo.open_issues_count,
            language: repo.language,
            topics: repo.topics,
            created_at: parse_timestamp(repo.created_at.as_deref()),
            updated_at: parse_timestamp(repo.updated_at.as_deref()),
            pushed_at: parse_timestamp(repo.pushed_at.as_deref()),
            archived: repo.archived,
        }
    }
}

pub struct GitHubSearch {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubSearch {
    /// Reads `GITHUB_TOKEN` once, here. The token is optional.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(response);
        }

        let headers = response.headers();
        let exhausted = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false);
        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .or(if exhausted { Some(60) } else { None });
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(SERVICE, status.as_u16(), retry_after, &body).into())
    }

    async fn run_search(&self, q: &str, page_size: usize) -> Result<Vec<SourceRepository>> {
        let per_page = page_size.clamp(1, 100).to_string();
        let request = self.get("/search/repositories").query(&[
            ("q", q),
            ("sort", "stars"),
            ("order", "desc"),
            ("per_page", per_page.as_str()),
        ]);
        let response = self.send(request).await?;
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;
        debug!(query = q, results = body.items.len(), "github search");
        Ok(body.items.into_iter().map(SourceRepository::from).collect())
    }
}

#[async_trait]
impl SourceSearch for GitHubSearch {
    async fn search(&self, query: &str, page_size: usize) -> Result<Vec<SourceRepository>> {
        self.run_search(query, page_size)
            .await
            .with_context(|| format!("repository search for {:?}", query))
    }

    async fn search_trending(
        &self,
        days_ago: i64,
        min_stars: i64,
        page_size: usize,
    ) -> Result<Vec<SourceRepository>> {
        let since = (chrono::Utc::now() - chrono::Duration::days(days_ago.max(1)))
            .format("%Y-%m-%d")
            .to_string();
        let q = trending_query(&since, min_stars);
        self.run_search(&q, page_size)
            .await
            .with_context(|| format!("trending search ({})", q))
    }

    async fn fetch_readme(&self, full_name: &str) -> Result<Option<Readme>> {
        let request = self
            .get(&format!("/repos/{}/readme", full_name))
            .header(reqwest::header::ACCEPT, "application/vnd.github.raw+json");
        let response = self.send(request).await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let content = response
            .text()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;
        Ok(Some(Readme::new(content)))
    }
}

fn trending_query(since: &str, min_stars: i64) -> String {
    format!("created:>{} stars:>={}", since, min_stars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_github_payload() {
        let json = serde_json::json!({
            "items": [{
                "id": 42,
                "node_id": "R_42",
                "full_name": "mperham/sidekiq",
                "name": "sidekiq",
                "owner": {"login": "mperham"},
                "description": "Simple, efficient background processing for Ruby",
                "html_url": "https://github.com/mperham/sidekiq",
                "stargazers_count": 13000,
                "forks_count": 2400,
                "open_issues_count": 10,
                "language": "Ruby",
                "topics": ["jobs", "ruby"],
                "created_at": "2012-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z",
                "pushed_at": null,
                "archived": false
            }]
        });
        let body: SearchResponse = serde_json::from_value(json).unwrap();
        let repo: SourceRepository = body.items.into_iter().next().unwrap().into();
        assert_eq!(repo.github_id, 42);
        assert_eq!(repo.owner, "mperham");
        assert_eq!(repo.stars, 13000);
        assert_eq!(repo.created_at, Some(1_325_376_000));
        assert_eq!(repo.pushed_at, None);
    }

    #[test]
    fn readme_hash_tracks_content() {
        let a = Readme::new("# Hello".to_string());
        let b = Readme::new("# Hello".to_string());
        let c = Readme::new("# Hello!".to_string());
        assert_eq!(a.sha, b.sha);
        assert_ne!(a.sha, c.sha);
        assert_eq!(a.sha.len(), 64);
    }

    #[test]
    fn trending_query_format() {
        assert_eq!(
            trending_query("2026-01-01", 100),
            "created:>2026-01-01 stars:>=100"
        );
    }
}
