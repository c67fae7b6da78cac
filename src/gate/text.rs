//! Tokenization helpers for request scoring.

use std::collections::BTreeSet;

/// Minimum token length counted for overlap scoring.
const MIN_TOKEN_CHARS: usize = 3;

/// Lower-cased words of `text`, split on anything that is not alphanumeric.
#[must_use]
pub fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Distinct words of at least three characters, used for overlap scoring.
#[must_use]
pub fn tokens(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() >= MIN_TOKEN_CHARS)
        .collect()
}

/// Whether `phrase` occurs in `haystack` as a run of whole words.
#[must_use]
pub fn contains_phrase(haystack: &[String], phrase: &str) -> bool {
    let needle = words(phrase);
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// Fraction of `target` tokens present in `candidate`.
///
/// Returns 0 for an empty target.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Token counts are small.
pub fn coverage(target: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f64 {
    if target.is_empty() {
        return 0.0;
    }
    let shared = target.intersection(candidate).count();
    shared as f64 / target.len() as f64
}
