//! Answer extraction from free-form generations
//!
//! Parse misses never fail: when the expected phrasing is absent the raw
//! text is kept, so every question still yields a string to score.

use regex::Regex;
use std::sync::LazyLock;

/// `The <property> of <name> is <value>`
static SINGLE_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"The\s+\w+\s+of\s+[^"]+\s+is\s+(.+)"#).expect("valid regex"));

/// One `is|are <value>` clause ended by `.` or `;`
static MULTI_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:is|are) (.*?)(?:\.|;)").expect("valid regex"));

/// Reference clauses are always `;`-terminated
static MULTI_ENTITY_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:is|are) (.*?);").expect("valid regex"));

/// Joins the values of a multi-entity answer
pub const MULTI_ENTITY_SEPARATOR: &str = "; ";

/// Text generated after the question.
///
/// Returns the segment between the first occurrence of `question` and the
/// next one (or the end). If the question is not echoed, the full text.
pub fn continuation<'a>(generated: &'a str, question: &str) -> &'a str {
    if question.is_empty() {
        return generated;
    }
    generated.split(question).nth(1).unwrap_or(generated)
}

/// Value of a single-entity answer, or the input when it does not follow
/// the expected phrasing. Surrounding whitespace is trimmed in both cases.
pub fn extract_single(answer_text: &str) -> String {
    SINGLE_ENTITY
        .captures(answer_text)
        .and_then(|c| c.get(1))
        .map_or(answer_text, |m| m.as_str())
        .trim()
        .to_string()
}

/// All `is|are` values of a multi-entity answer, joined with `"; "`
pub fn extract_multi(answer_text: &str) -> String {
    join_captures(&MULTI_ENTITY, answer_text)
}

/// Normalize a multi-entity ground truth the same way predictions are
pub fn normalize_reference(reference: &str) -> String {
    join_captures(&MULTI_ENTITY_REFERENCE, reference)
}

fn join_captures(pattern: &Regex, text: &str) -> String {
    pattern
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(MULTI_ENTITY_SEPARATOR)
}

/// Extract the normalized answer to `question` from `generated`.
///
/// `multi_entity` is the number of entities asked about; `None` for
/// single-entity questions.
pub fn extract(generated: &str, question: &str, multi_entity: Option<usize>) -> String {
    let answer_text = continuation(generated, question);
    match multi_entity {
        None => extract_single(answer_text),
        Some(_) => extract_multi(answer_text),
    }
}
