//! Keyword rules for the first routing stage.

use std::sync::LazyLock;

use regex::Regex;

use super::{DecisionSource, RoutePath, RoutingDecision};

/// Verbs that ask for the data to be changed or produced.
pub const EDIT_VERBS: &[&str] = &[
    "make", "update", "change", "modify", "edit", "replace", "rename", "filter", "delete", "drop",
    "add", "remove", "save", "create", "format", "convert", "read", "write", "output", "double",
    "halve", "increase", "decrease", "multiply", "divide",
];

/// Words that only make sense when talking about the tabular data itself.
pub const TABULAR_TERMS: &[&str] = &["excel", "sheet", "df", "dataframe", "pd", "column", "row"];

/// Leading words that turn an instruction into a question.
pub const INTERROGATIVES: &[&str] = &[
    "what", "which", "who", "where", "when", "why", "how", "is", "are", "does", "do",
];

pub const REASON_KEYWORD_MATCH: &str = "keyword match";
pub const REASON_QUESTION_PHRASING: &str = "question phrasing detected";
pub const REASON_QUESTION_FORM: &str = "question form indicates an information request";
pub const REASON_NO_EDIT_INDICATORS: &str = "no edit indicators found";

static EDIT_INDICATOR: LazyLock<Regex> = LazyLock::new(|| {
    let words: Vec<String> = EDIT_VERBS
        .iter()
        .chain(TABULAR_TERMS)
        .map(|w| regex::escape(w))
        .collect();
    Regex::new(&format!(r"\b(?:{})(?:s|es|d|ed|ing)?\b", words.join("|")))
        .expect("Invalid edit indicator regex")
});

/// True when any edit verb or tabular term occurs as a word, allowing
/// plural and inflected endings ("rows", "doubled", "adding").
pub fn has_edit_indicator(text: &str) -> bool {
    EDIT_INDICATOR.is_match(text)
}

/// True when the first word is an interrogative and more text follows it.
pub fn starts_with_interrogative(text: &str) -> bool {
    match text.split_once(char::is_whitespace) {
        Some((first, rest)) => !rest.trim().is_empty() && INTERROGATIVES.contains(&first),
        None => false,
    }
}

/// Classifies an instruction from its wording alone.
///
/// Edit indicators are looked for anywhere in the text first; the
/// interrogative check only looks at the leading word and wins over them.
pub fn rule_route(instruction: &str) -> RoutingDecision {
    let text = instruction.trim().to_lowercase();
    let question = starts_with_interrogative(&text);

    let (path, reason) = if has_edit_indicator(&text) {
        if question {
            (RoutePath::Query, REASON_QUESTION_PHRASING)
        } else {
            (RoutePath::Edit, REASON_KEYWORD_MATCH)
        }
    } else if question {
        (RoutePath::Query, REASON_QUESTION_FORM)
    } else {
        (RoutePath::Query, REASON_NO_EDIT_INDICATORS)
    };

    RoutingDecision {
        path,
        reason: reason.to_string(),
        source: DecisionSource::Rule,
    }
}
