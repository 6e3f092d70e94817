//! Tokenization shared by indexing and querying.

use regex::Regex;
use std::sync::OnceLock;

// Stop words add noise and don't help with retrieval
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "should", "could", "what", "which", "who", "where", "when",
    "why", "how", "this", "that", "these", "those", "it", "its",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("Invalid regex pattern"))
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lowercase, split on anything that is not a letter or digit, drop stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    token_pattern()
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|token| !is_stop_word(token))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Rust-based KV_store, v2.0!"),
            vec!["rust", "based", "kv", "store", "v2", "0"]
        );
    }

    #[test]
    fn test_tokenize_drops_stop_words() {
        assert_eq!(tokenize("What is the plan for Alpha"), vec!["plan", "alpha"]);
        assert!(tokenize("the and of").is_empty());
    }

    #[test]
    fn test_tokenize_keeps_unicode_letters() {
        assert_eq!(tokenize("Zürich café"), vec!["zürich", "café"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("  ---  ").is_empty());
    }
}
