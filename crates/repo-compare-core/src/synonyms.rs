//! Static synonym expansion for search terms.
//!
//! A term that belongs to a synonym group expands to the whole group; any
//! other term expands to itself. Lookup happens on the normalized term.

use std::collections::HashSet;

use crate::normalize::normalize_query;

/// Groups of interchangeable search terms. All entries are normalized.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["auth", "authentication", "authorization", "login", "oauth", "sso"],
    &["background jobs", "background job", "job queue", "task queue", "worker", "workers"],
    &["k8s", "kubernetes"],
    &["js", "javascript", "ecmascript"],
    &["ts", "typescript"],
    &["py", "python"],
    &["golang", "go"],
    &["rails", "ruby on rails", "ror"],
    &["postgres", "postgresql", "pg"],
    &["db", "database", "datastore"],
    &["orm", "object relational mapping", "active record"],
    &["ml", "machine learning"],
    &["ai", "artificial intelligence", "llm"],
    &["ci", "continuous integration", "ci/cd"],
    &["cd", "continuous delivery", "continuous deployment"],
    &["api", "rest", "rest api", "http api"],
    &["graphql", "gql"],
    &["realtime", "real-time", "websocket", "websockets"],
    &["test", "testing", "tests", "spec", "specs"],
    &["cache", "caching"],
    &["search", "full-text search", "full text search"],
    &["queue", "message queue", "message broker"],
    &["cli", "command line", "command-line"],
    &["ui", "user interface", "frontend"],
    &["payments", "payment", "billing"],
    &["monitoring", "observability", "metrics"],
    &["logging", "logs", "log"],
];

/// Expand one term into its synonym set.
///
/// Never empty: unknown terms come back as `[term]` (normalized), and a
/// blank term comes back as `[""]`. Callers that score text skip blank
/// terms before expanding.
pub fn expand(term: &str) -> Vec<String> {
    let normalized = normalize_query(term);
    if normalized.is_empty() {
        return vec![normalized];
    }

    for group in SYNONYM_GROUPS {
        if group.contains(&normalized.as_str()) {
            return group.iter().map(|s| s.to_string()).collect();
        }
    }

    vec![normalized]
}

/// Union of the expansions of every term, deduplicated, first-seen order.
pub fn expand_all<S: AsRef<str>>(terms: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for term in terms {
        if term.as_ref().trim().is_empty() {
            continue;
        }
        for variant in expand(term.as_ref()) {
            if seen.insert(variant.clone()) {
                out.push(variant);
            }
        }
    }
    out
}
