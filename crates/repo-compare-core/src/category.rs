//! Three-layer category resolution.
//!
//! Maps a free-text label plus a [`CategoryType`] onto a canonical
//! [`Category`], creating one only when nothing similar exists:
//!
//! 1. **Alias**: a static per-type table collapses spelling variants
//!    ("ror", "rails", "ruby on rails") onto one display name, which is then
//!    looked up by its type-scoped slug.
//! 2. **Lexical**: trigram [`similarity`] between normalized names; the best
//!    category at or above `lexical_threshold` wins.
//! 3. **Semantic**: cosine similarity between the label's embedding and the
//!    stored embeddings of every category of the type; the best at or above
//!    `semantic_threshold` wins.
//!
//! On a miss a new category is created with a generated slug and default
//! description. The embedding computed for layer 3 is stored with it. An
//! embedding failure never fails resolution: layer 3 is skipped and the
//! category is created without a vector, to be filled in later by
//! [`CategoryResolver::embed_missing`].
//!
//! Layer 3 scans all categories of the type linearly.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::models::{Category, CategoryType, NewCategory};
use crate::normalize::normalize_query;
use crate::similarity::similarity;
use crate::store::Store;

/// `(variant, canonical name)` pairs per category type. Variants are
/// matched after normalization.
const TECHNOLOGY_ALIASES: &[(&str, &str)] = &[
    ("ror", "Ruby on Rails"),
    ("rails", "Ruby on Rails"),
    ("ruby on rails", "Ruby on Rails"),
    ("k8s", "Kubernetes"),
    ("kube", "Kubernetes"),
    ("kubernetes", "Kubernetes"),
    ("js", "JavaScript"),
    ("javascript", "JavaScript"),
    ("ts", "TypeScript"),
    ("typescript", "TypeScript"),
    ("py", "Python"),
    ("python", "Python"),
    ("golang", "Go"),
    ("go", "Go"),
    ("postgres", "PostgreSQL"),
    ("postgresql", "PostgreSQL"),
    ("pg", "PostgreSQL"),
    ("mongo", "MongoDB"),
    ("mongodb", "MongoDB"),
    ("node", "Node.js"),
    ("nodejs", "Node.js"),
    ("node.js", "Node.js"),
    ("react.js", "React"),
    ("reactjs", "React"),
    ("react", "React"),
    ("vue.js", "Vue"),
    ("vuejs", "Vue"),
    ("vue", "Vue"),
    ("rust", "Rust"),
    ("rustlang", "Rust"),
    ("c++", "C++"),
    ("cpp", "C++"),
    ("c#", "C#"),
    ("csharp", "C#"),
    ("dotnet", ".NET"),
    (".net", ".NET"),
    ("redis", "Redis"),
    ("tf", "Terraform"),
    ("terraform", "Terraform"),
    ("sidekiq", "Sidekiq"),
];

const PROBLEM_DOMAIN_ALIASES: &[(&str, &str)] = &[
    ("auth", "Authentication"),
    ("authn", "Authentication"),
    ("authentication", "Authentication"),
    ("authz", "Authorization"),
    ("authorization", "Authorization"),
    ("background jobs", "Background Jobs"),
    ("job queue", "Background Jobs"),
    ("job processing", "Background Jobs"),
    ("ml", "Machine Learning"),
    ("machine learning", "Machine Learning"),
    ("ci", "Continuous Integration"),
    ("ci/cd", "Continuous Integration"),
    ("observability", "Observability"),
    ("monitoring", "Observability"),
    ("payments", "Payments"),
    ("payment processing", "Payments"),
];

const ARCHITECTURE_ALIASES: &[(&str, &str)] = &[
    ("microservice", "Microservices"),
    ("microservices", "Microservices"),
    ("mvc", "MVC"),
    ("model view controller", "MVC"),
    ("event driven", "Event-Driven"),
    ("event-driven", "Event-Driven"),
    ("eda", "Event-Driven"),
    ("serverless", "Serverless"),
    ("faas", "Serverless"),
    ("monolith", "Monolith"),
    ("plugin", "Plugin Architecture"),
    ("plugins", "Plugin Architecture"),
    ("cqrs", "CQRS"),
];

const MATURITY_ALIASES: &[(&str, &str)] = &[
    ("prod ready", "Production Ready"),
    ("production-ready", "Production Ready"),
    ("production ready", "Production Ready"),
    ("stable", "Production Ready"),
    ("beta", "Beta"),
    ("alpha", "Experimental"),
    ("experimental", "Experimental"),
    ("unmaintained", "Abandoned"),
    ("abandoned", "Abandoned"),
    ("deprecated", "Abandoned"),
];

fn aliases(category_type: CategoryType) -> &'static [(&'static str, &'static str)] {
    match category_type {
        CategoryType::Technology => TECHNOLOGY_ALIASES,
        CategoryType::ProblemDomain => PROBLEM_DOMAIN_ALIASES,
        CategoryType::ArchitecturePattern => ARCHITECTURE_ALIASES,
        CategoryType::Maturity => MATURITY_ALIASES,
    }
}

/// Display name for `name`: the alias target if one exists, otherwise the
/// trimmed label with whitespace runs collapsed.
pub fn canonical_name(name: &str, category_type: CategoryType) -> String {
    let key = normalize_query(name);
    aliases(category_type)
        .iter()
        .find(|(variant, _)| *variant == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// URL-safe slug, unique within a category type.
///
/// `+` and `#` are spelled out so "C++" and "C#" do not collapse onto "c".
///
/// ```rust
/// use repo_compare_core::category::slugify;
///
/// assert_eq!(slugify("Ruby on Rails"), "ruby-on-rails");
/// assert_eq!(slugify("C++"), "cplusplus");
/// assert_eq!(slugify("  Event-Driven!! "), "event-driven");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        match ch {
            '+' => slug.push_str("plus"),
            '#' => slug.push_str("sharp"),
            c if c.is_alphanumeric() => slug.push(c),
            _ => {
                if !slug.is_empty() && !slug.ends_with('-') {
                    slug.push('-');
                }
            }
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn default_description(name: &str, category_type: CategoryType) -> String {
    let kind = match category_type {
        CategoryType::Technology => "built with or for",
        CategoryType::ProblemDomain => "addressing",
        CategoryType::ArchitecturePattern => "following the pattern",
        CategoryType::Maturity => "at maturity level",
    };
    format!("Repositories {} {}", kind, name)
}

/// Which layer produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLayer {
    /// Slug of the (alias-canonicalized) name already exists.
    Exact,
    Lexical,
    Semantic,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub category: Category,
    pub layer: MatchLayer,
    /// Similarity that accepted the match; `1.0` for exact and created.
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverThresholds {
    pub lexical: f64,
    pub semantic: f64,
}

impl Default for ResolverThresholds {
    fn default() -> Self {
        Self {
            lexical: 0.55,
            semantic: 0.75,
        }
    }
}

pub struct CategoryResolver {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    thresholds: ResolverThresholds,
}

impl CategoryResolver {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingService>>,
        thresholds: ResolverThresholds,
    ) -> Self {
        Self {
            store,
            embedder,
            thresholds,
        }
    }

    /// Resolve `name` to a category, creating it if no layer matches.
    pub async fn find_or_create(
        &self,
        name: &str,
        category_type: CategoryType,
        now: i64,
    ) -> Result<Category> {
        Ok(self.resolve(name, category_type, now).await?.category)
    }

    pub async fn resolve(
        &self,
        name: &str,
        category_type: CategoryType,
        now: i64,
    ) -> Result<Resolution> {
        let canonical = canonical_name(name, category_type);
        let slug = slugify(&canonical);
        if slug.is_empty() {
            bail!("cannot resolve a category from blank label {:?}", name);
        }

        if let Some(category) = self.store.find_category_by_slug(category_type, &slug).await? {
            return Ok(Resolution {
                category,
                layer: MatchLayer::Exact,
                score: 1.0,
            });
        }

        let existing = self.store.categories_by_type(category_type).await?;

        let key = normalize_query(&canonical);
        let lexical = existing
            .iter()
            .map(|c| (c, similarity(&key, &normalize_query(&c.name))))
            .filter(|(_, s)| *s >= self.thresholds.lexical)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((category, score)) = lexical {
            debug!(label = name, matched = %category.name, score, "lexical category match");
            return Ok(Resolution {
                category: category.clone(),
                layer: MatchLayer::Lexical,
                score,
            });
        }

        let embedding = self.embed_label(&key).await;
        if let Some(ref query) = embedding {
            let semantic = existing
                .iter()
                .filter_map(|c| {
                    c.embedding
                        .as_ref()
                        .map(|e| (c, cosine_similarity(query, e) as f64))
                })
                .filter(|(_, s)| *s >= self.thresholds.semantic)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((category, score)) = semantic {
                debug!(label = name, matched = %category.name, score, "semantic category match");
                return Ok(Resolution {
                    category: category.clone(),
                    layer: MatchLayer::Semantic,
                    score,
                });
            }
        }

        let new = NewCategory {
            name: canonical.clone(),
            slug,
            category_type,
            description: default_description(&canonical, category_type),
            embedding,
        };
        let category = self.store.insert_category(&new, now).await?;
        debug!(name = %category.name, category_type = %category_type, "created category");
        Ok(Resolution {
            category,
            layer: MatchLayer::Created,
            score: 1.0,
        })
    }

    /// Embed every category of `category_type` that has no vector yet.
    /// Returns how many were filled in. Failures are logged and skipped.
    pub async fn embed_missing(&self, category_type: CategoryType) -> Result<usize> {
        let embedder = match &self.embedder {
            Some(e) => e,
            None => return Ok(0),
        };
        let mut filled = 0;
        for category in self.store.categories_by_type(category_type).await? {
            if category.embedding.is_some() {
                continue;
            }
            match embedder.embed(&normalize_query(&category.name)).await {
                Ok(vector) => {
                    self.store.set_category_embedding(category.id, &vector).await?;
                    filled += 1;
                }
                Err(e) => {
                    warn!(category = %category.name, error = %e, "embedding failed; will retry later");
                }
            }
        }
        Ok(filled)
    }

    async fn embed_label(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                warn!(label = text, error = %e, "embedding unavailable; skipping semantic match");
                None
            }
        }
    }
}
