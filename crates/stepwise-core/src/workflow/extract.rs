//! Structured-data extraction from model responses.
//!
//! Candidates are tried in order and the first that parses as JSON wins:
//! fenced code blocks, the whole response, then the largest
//! brace- or bracket-delimited substring.

use serde_json::Value;

/// Parse JSON out of free-form model text. `None` when nothing parses.
pub fn extract_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    fenced_blocks(trimmed)
        .into_iter()
        .chain(std::iter::once(trimmed))
        .chain(largest_delimited(trimmed))
        .find_map(parse_structured)
}

/// Only objects and arrays count as structured; a bare `42` or `"x"` does not.
fn parse_structured(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Bodies of ``` fenced blocks, with any language tag dropped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let body_start = after_open.find('\n').map_or(0, |i| i + 1);
        let body = &after_open[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// The longer of the outermost `{...}` and `[...]` spans.
fn largest_delimited(text: &str) -> Option<&str> {
    let span = |open: char, close: char| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start).then(|| &text[start..=end])
    };
    match (span('{', '}'), span('[', ']')) {
        (Some(obj), Some(arr)) => Some(if arr.len() > obj.len() { arr } else { obj }),
        (obj, arr) => obj.or(arr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_block_wins() {
        let text = "Here you go:\n```json\n{\"label\": \"positive\"}\n```\nAnything else?";
        assert_eq!(extract_structured(text), Some(json!({ "label": "positive" })));
    }

    #[test]
    fn whole_response_parses() {
        assert_eq!(extract_structured(" [1, 2, 3] "), Some(json!([1, 2, 3])));
    }

    #[test]
    fn largest_substring_fallback() {
        let text = "The answer is {\"score\": 0.9, \"tags\": [\"a\"]} as requested.";
        assert_eq!(
            extract_structured(text),
            Some(json!({ "score": 0.9, "tags": ["a"] }))
        );
    }

    #[test]
    fn skips_unparseable_fence_then_tries_rest() {
        let text = "```\nnot json\n```\n{\"ok\": true}";
        assert_eq!(extract_structured(text), Some(json!({ "ok": true })));
    }

    #[test]
    fn plain_prose_is_none() {
        assert_eq!(extract_structured("Rust is a systems language."), None);
        assert_eq!(extract_structured("42"), None);
        assert_eq!(extract_structured(""), None);
    }
}
