//! Keyword-set similarity used by the remediation log.

use std::collections::HashSet;

/// Splits on non-alphanumeric characters, lowercases, and keeps tokens
/// longer than 3 characters. Short words ("the", "is", "out") carry no
/// signal for matching problem descriptions.
pub fn extract(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 3)
        .map(|token| token.to_lowercase())
        .collect()
}

/// Size of the intersection between two keyword sets.
pub fn count_matches(a: &HashSet<String>, b: &HashSet<String>) -> usize {
    a.intersection(b).count()
}
