//! Trigram string similarity.
//!
//! Follows the `pg_trgm` model: text is lowercased and split into words on
//! non-alphanumeric characters, each word is padded with two leading spaces
//! and one trailing space, and the set of three-character windows is taken.
//!
//! - [`similarity`]: Jaccard overlap of the two trigram sets, in `[0, 1]`.
//! - [`word_similarity`]: best [`similarity`] between the needle and any
//!   contiguous run of words in the haystack, so a short term can match
//!   inside a longer text.

use std::collections::HashSet;

/// The padded trigram set of `text`.
pub fn trigrams(text: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    for word in words(text) {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            set.insert(window.iter().collect());
        }
    }
    set
}

/// Jaccard similarity of the trigram sets of `a` and `b`.
///
/// Identical (non-empty) strings score `1.0`; strings sharing no trigram
/// score `0.0`. Empty input on either side scores `0.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    jaccard(&ta, &tb)
}

/// Best similarity between `needle` and any contiguous window of words in
/// `haystack`. Windows span up to one word more than the needle has.
pub fn word_similarity(needle: &str, haystack: &str) -> f64 {
    let needle_set = trigrams(needle);
    if needle_set.is_empty() {
        return 0.0;
    }
    let hay_words = words(haystack);
    if hay_words.is_empty() {
        return 0.0;
    }

    let max_window = (words(needle).len() + 1).min(hay_words.len());
    let mut best = 0.0f64;
    for size in 1..=max_window {
        for window in hay_words.windows(size) {
            let score = jaccard(&needle_set, &trigrams(&window.join(" ")));
            if score > best {
                best = score;
                if best >= 1.0 {
                    return 1.0;
                }
            }
        }
    }
    best
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        let q = "rails background jobs with retry logic";
        assert!(similarity(q, q) >= 0.99);
    }

    #[test]
    fn unrelated_strings_score_near_zero() {
        let sim = similarity("rails background jobs", "quantum xyz plotting");
        assert!(sim < 0.1, "got {}", sim);
    }

    #[test]
    fn empty_scores_zero() {
        assert_eq!(similarity("", "rails"), 0.0);
        assert_eq!(similarity("", ""), 0.0);
        assert_eq!(word_similarity("", "rails"), 0.0);
    }

    #[test]
    fn case_and_punctuation_insensitive() {
        assert!(similarity("Node.js", "node js") >= 0.99);
    }

    #[test]
    fn closer_strings_score_higher() {
        let base = "rails background jobs";
        let near = similarity(base, "rails background job");
        let far = similarity(base, "django background tasks");
        assert!(near > far);
        assert!(near > 0.6);
    }

    #[test]
    fn word_similarity_finds_term_inside_text() {
        let text = "Background job processing for Ruby on Rails";
        assert!(word_similarity("rails", text) >= 0.99);
        assert!(similarity("rails", text) < 0.3);
        assert!(word_similarity("kubernetes", text) < 0.2);
    }

    #[test]
    fn trigram_padding() {
        let t = trigrams("ab");
        assert!(t.contains("  a"));
        assert!(t.contains(" ab"));
        assert!(t.contains("ab "));
        assert_eq!(t.len(), 3);
    }
}
