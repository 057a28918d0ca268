//! Cleanup helpers for raw oracle output.

use std::sync::LazyLock;

use regex::Regex;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*```[A-Za-z0-9_+-]*[ \t]*$").expect("Invalid regex for code fences")
});

/// Strips markdown code fences from generated code.
///
/// When the answer contains a fenced block, only the first block's body is
/// kept (models like to add prose around it). Without fences the text is
/// returned trimmed.
pub fn strip_code_fences(content: &str) -> String {
    let fences: Vec<_> = CODE_FENCE.find_iter(content).collect();
    match fences.as_slice() {
        [] => content.trim().to_string(),
        [open] => {
            // Unterminated block: everything after the opening fence.
            content[open.end()..].trim().to_string()
        }
        [open, close, ..] => content[open.end()..close.start()].trim().to_string(),
    }
}

/// Finds the first balanced JSON object in free text.
///
/// Handles surrounding prose, fenced blocks and nested braces inside strings.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = content[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = find_matching_brace(&content[start..]) {
            let candidate = &content[start..=start + end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Index of the '}' closing the object that `s` starts with.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Shortens `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
