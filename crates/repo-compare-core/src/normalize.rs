//! Query normalization for cache keys and fuzzy comparisons.
//!
//! The same function is applied when a comparison is written and when a new
//! request is looked up, so the two sides always agree.

/// Trim, lowercase, and collapse internal whitespace runs to one space.
///
/// Total and idempotent: blank input yields an empty string and
/// `normalize_query(normalize_query(x)) == normalize_query(x)`.
///
/// ```rust
/// use repo_compare_core::normalize::normalize_query;
///
/// assert_eq!(normalize_query(" Rails  Background   JOBS "), "rails background jobs");
/// ```
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
