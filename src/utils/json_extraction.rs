//! JSON extraction from model responses.
//!
//! Judges are asked for a bare JSON object, but models still wrap it in
//! markdown fences or surround it with prose. Strategies, in order:
//! 1. The whole response parses as JSON
//! 2. A fenced ```` ```json ```` block
//! 3. Any fenced block
//! 4. The first balanced `{...}` object anywhere in the text
//!
//! With `strict` set only strategy 1 is tried.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },

    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

fn json_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)\s*\n(.*?)```").expect("Invalid regex for json fence")
    })
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n(.*?)```").expect("Invalid regex for code fence")
    })
}

fn preview(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Byte index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escapes are honoured, so braces inside strings do not
/// count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Counts braces left open at the end of `s`, ignoring string contents.
fn unclosed_braces(s: &str) -> usize {
    let mut depth = 0isize;
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

/// Extracts the first JSON object from a model response.
///
/// # Errors
///
/// `Truncated` when an object starts but never closes (typically an output
/// token limit), `NotFound` otherwise.
pub fn extract_json_object(content: &str, strict: bool) -> Result<Value, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(value) = parse_object(trimmed) {
        return Ok(value);
    }
    if strict {
        return Err(JsonExtractionError::NotFound {
            content_preview: preview(trimmed, 50),
        });
    }

    for re in [json_fence(), any_fence()] {
        for caps in re.captures_iter(trimmed) {
            if let Some(value) = caps.get(1).and_then(|m| parse_object(m.as_str())) {
                return Ok(value);
            }
        }
    }

    let mut search_from = 0;
    while let Some(offset) = trimmed[search_from..].find('{') {
        let start = search_from + offset;
        let rest = &trimmed[start..];
        match find_matching_brace(rest) {
            Some(end) => {
                if let Some(value) = parse_object(&rest[..=end]) {
                    return Ok(value);
                }
                search_from = start + 1;
            }
            None => {
                return Err(JsonExtractionError::Truncated {
                    partial_preview: preview(rest, 100),
                    unclosed_braces: unclosed_braces(rest),
                });
            }
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}
