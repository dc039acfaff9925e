//! Token-level text utilities shared across pipeline stages
//!
//! Jaccard over lowercased tokens (length > 2) is the single similarity
//! metric used for reformulation dedup, retrieval diversity filtering,
//! rerank/synthesis diversity scores and topic-shift detection.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

lazy_static! {
    /// Leading strategy labels LLMs like to prepend ("Expanded query:", "Sub-question:").
    static ref LABEL_PREFIX: Regex = Regex::new(
        r"(?i)^\s*(?:expanded|clarified|simplified|decomposed|rephrased|reformulated|alternative|variation|sub)[\s-]?(?:query|question|queries|questions)?\s*:\s*"
    ).unwrap();
    /// List numbering ("1.", "2)", "- ", "* ").
    static ref LIST_PREFIX: Regex = Regex::new(r"^\s*(?:\d+[.)]\s*|[-*]\s+)").unwrap();
}

/// Lowercased token set, keeping tokens longer than 2 characters.
pub fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

/// Exact Jaccard similarity between two token sets.
///
/// J(A, B) = |A ∩ B| / |A ∪ B|. Returns 0.0 when both sets are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Jaccard similarity between two texts.
pub fn text_jaccard(a: &str, b: &str) -> f64 {
    jaccard(&token_set(a), &token_set(b))
}

/// Mean pairwise (1 - Jaccard) over a set of texts.
///
/// Returns 0.0 for fewer than two texts (no pairs to compare).
pub fn mean_pairwise_diversity<S: AsRef<str>>(texts: &[S]) -> f64 {
    if texts.len() < 2 {
        return 0.0;
    }
    let sets: Vec<HashSet<String>> = texts.iter().map(|t| token_set(t.as_ref())).collect();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            total += 1.0 - jaccard(&sets[i], &sets[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Strip strategy labels, list numbering and surrounding quotes from a
/// generated candidate.
pub fn clean_candidate(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    // Prefixes can stack ("1. Expanded query: ..."), strip until stable.
    loop {
        let stripped = LIST_PREFIX.replace(&s, "");
        let stripped = LABEL_PREFIX.replace(&stripped, "");
        let stripped = stripped.trim_start();
        if stripped == s {
            break;
        }
        s = stripped.to_string();
    }
    let mut out = s.trim().to_string();
    for quote in ['"', '\''] {
        if out.len() >= 2 && out.starts_with(quote) && out.ends_with(quote) {
            out = out[1..out.len() - 1].trim().to_string();
        }
    }
    out
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Deterministic feature-hashed bag-of-words embedding, unit norm.
///
/// Fallback key/value vectors for the delta memory when no embedding
/// provider is configured. All-zero input text yields the zero vector.
pub fn hashed_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dim.max(1)];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h % vec.len() as u64) as usize;
        // Second hash bit picks the sign so common tokens do not all pile
        // onto the positive orthant.
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign;
    }
    normalize(&mut vec);
    vec
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left unchanged.
pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_set_filters_short_tokens() {
        let tokens = token_set("What is the capital of France?");
        assert!(tokens.contains("what"));
        assert!(tokens.contains("capital"));
        assert!(tokens.contains("france"));
        assert!(!tokens.contains("is"));
        assert!(!tokens.contains("of"));
    }

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        assert_eq!(text_jaccard("quarterly revenue report", "quarterly revenue report"), 1.0);
        assert_eq!(text_jaccard("quarterly revenue", "chocolate cake"), 0.0);
        assert_eq!(text_jaccard("", ""), 0.0);
    }

    #[test]
    fn test_clean_candidate_strips_labels_and_quotes() {
        assert_eq!(clean_candidate("Expanded query: \"solar panel efficiency\""), "solar panel efficiency");
        assert_eq!(clean_candidate("1. What drives inflation?"), "What drives inflation?");
        assert_eq!(clean_candidate("- 2) Sub-question: how does RRF work?"), "how does RRF work?");
        assert_eq!(clean_candidate("plain text"), "plain text");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn test_hashed_embedding_deterministic_and_normalized() {
        let a = hashed_embedding("the quick brown fox", 32);
        let b = hashed_embedding("the quick brown fox", 32);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_mean_pairwise_diversity() {
        let disjoint = ["alpha beta gamma", "delta epsilon zeta"];
        assert_eq!(mean_pairwise_diversity(&disjoint), 1.0);
        let single = ["only one"];
        assert_eq!(mean_pairwise_diversity(&single), 0.0);
    }
}
