use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Minimum token length kept; shorter fragments (articles, separators)
/// match too many documents to discriminate.
const MIN_TOKEN_LEN: usize = 3;

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9]+").unwrap())
}

/// Deduplicated lowercase word tokens of a document's indexable text.
/// Hyphenated and dotted identifiers ("cpu-usage", "dashboards.example.io")
/// split into their word parts so partial matches work.
pub fn tokenize_text(text: &str) -> HashSet<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .collect()
}

/// Query terms, normalized the same way as document text so lookups
/// compare like with like. Order is preserved; scoring decides how
/// repeats count.
pub fn tokenize_query(query: &str) -> Vec<String> {
    word_pattern()
        .find_iter(query)
        .map(|m| m.as_str().to_lowercase())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .collect()
}
