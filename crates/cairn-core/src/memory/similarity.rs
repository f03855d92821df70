//! Task fingerprints and token-overlap similarity

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::constants::memory::{INPUT_WEIGHT, PATTERN_WORDS};

/// Words ignored by tokenisation and pattern mining
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "been", "but", "by", "can", "could", "do", "does", "for", "from", "get", "had", "has",
    "have", "he", "her", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just",
    "kindly", "me", "my", "no", "not", "now", "of", "on", "or", "our", "please", "she", "should",
    "so", "some", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "to", "up", "us", "was", "we", "were", "what", "when", "where", "which", "who",
    "will", "with", "would", "you", "your",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Lowercase hex SHA-256 of `input`, truncated to 16 digits
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(16);
    hex
}

/// Dedup key for a task: normalized input and context
pub fn task_hash(input: &str, context: &str) -> String {
    let normalized = format!(
        "{}_{}",
        input.trim().to_lowercase(),
        context.trim().to_lowercase()
    );
    short_hash(&normalized)
}

/// Lowercased words in order of appearance, stopwords removed
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !is_stopword(w))
}

/// Distinct content tokens of `text`
pub fn tokens(text: &str) -> HashSet<String> {
    words(text).collect()
}

/// Shared tokens over the size of the larger token set
///
/// Two texts with no tokens at all are identical (1.0); one empty side gives 0.0.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / larger as f64
}

/// Weighted similarity of two (input, context) pairs
pub fn task_similarity(input_a: &str, context_a: &str, input_b: &str, context_b: &str) -> f64 {
    INPUT_WEIGHT * word_overlap(input_a, input_b)
        + (1.0 - INPUT_WEIGHT) * word_overlap(context_a, context_b)
}

fn is_content_word(word: &str) -> bool {
    word.chars().count() > 3
}

/// Every content word of `text` in order, joined by single spaces
///
/// Uses the same filter as habit patterns, so a command contains the words
/// of the habit mined from it.
pub fn content_text(text: &str) -> String {
    words(text)
        .filter(|w| is_content_word(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// First content words (longer than three characters) of `input`, deduplicated
pub fn content_words(input: &str) -> Vec<String> {
    let mut picked: Vec<String> = Vec::with_capacity(PATTERN_WORDS);
    for word in words(input).filter(|w| is_content_word(w)) {
        if !picked.contains(&word) {
            picked.push(word);
        }
        if picked.len() == PATTERN_WORDS {
            break;
        }
    }
    picked
}

/// Habit pattern for a task: `task_type:word word word`
pub fn derive_pattern(task_type: &str, input: &str) -> String {
    format!("{}:{}", task_type, content_words(input).join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_hash_normalizes_case_and_whitespace() {
        assert_eq!(
            task_hash("  Open Chrome ", "Desktop"),
            task_hash("open chrome", "  desktop")
        );
        assert_ne!(task_hash("open chrome", ""), task_hash("open chrome", "desktop"));
        assert_eq!(task_hash("x", "y").len(), 16);
    }

    #[test]
    fn test_task_hash_separates_input_and_context() {
        // The "_" joiner is part of the fingerprint
        assert_eq!(task_hash("a_b", ""), task_hash("a", "b_"));
        assert_ne!(task_hash("ab", ""), task_hash("a", "b"));
    }

    #[test]
    fn test_tokens_drop_stopwords_and_punctuation() {
        let t = tokens("Please, open the Chrome browser!");
        assert_eq!(t.len(), 3);
        assert!(t.contains("open"));
        assert!(t.contains("chrome"));
        assert!(t.contains("browser"));
    }

    #[test]
    fn test_content_text_contains_derived_pattern() {
        let input = "Open a new Chrome window";
        assert_eq!(content_text(input), "open chrome window");
        let pattern = derive_pattern("app_launch", input);
        assert!(pattern.ends_with(&content_text(input)));
        assert_eq!(content_text("go to it"), "");
    }

    #[test]
    fn test_word_overlap_uses_larger_set() {
        assert_eq!(word_overlap("open chrome", "open chrome"), 1.0);
        assert!((word_overlap("open chrome", "open safari browser") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(word_overlap("", ""), 1.0);
        assert_eq!(word_overlap("open", ""), 0.0);
    }

    #[test]
    fn test_politeness_does_not_change_similarity() {
        let score = task_similarity("open chrome", "", "open chrome please", "");
        assert!(score >= 0.8, "score was {score}");
    }

    #[test]
    fn test_similarity_weights_input_over_context() {
        let input_only = task_similarity("send report", "work", "send report", "home");
        assert!((input_only - 0.7).abs() < 1e-9);
        let context_only = task_similarity("send report", "work", "play music", "work");
        assert!((context_only - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_derive_pattern_takes_first_three_content_words() {
        assert_eq!(
            derive_pattern("email_composition", "Write an email to John about the quarterly budget"),
            "email_composition:write email john"
        );
        assert_eq!(
            derive_pattern("app_launch", "open open open chrome"),
            "app_launch:open chrome"
        );
        assert_eq!(derive_pattern("app_launch", "go"), "app_launch:");
    }
}
