//! Tolerant parsing of LLM JSON output
//!
//! Model output is free text: it may be wrapped in code fences (with or
//! without a language tag), carry `//` or `/* */` comments, trailing commas,
//! or prose around the payload. The helpers here recover the JSON value
//! without ever failing hard; callers fall back to a safe default op when
//! nothing can be recovered.

use serde_json::Value;

use crate::error::{Error, Result};

/// Parse an LLM response into a JSON value.
///
/// Attempts, in order: fence stripping + strict parse, comment/trailing-comma
/// cleanup, then balanced bracket extraction over the cleaned text.
pub fn parse_lenient(response: &str) -> Result<Value> {
    let stripped = strip_code_fences(response);
    let stripped = stripped.trim();

    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        return Ok(value);
    }

    let cleaned = strip_trailing_commas(&strip_comments(stripped));
    if let Ok(value) = serde_json::from_str::<Value>(cleaned.trim()) {
        return Ok(value);
    }

    // Last resort: pull out the outermost balanced object or array.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(fragment) = extract_balanced(&cleaned, open, close) {
            if let Ok(value) = serde_json::from_str::<Value>(fragment) {
                return Ok(value);
            }
        }
    }

    Err(Error::invalid_input(format!(
        "unparseable LLM response: {}",
        response.chars().take(200).collect::<String>()
    )))
}

/// Strip a leading/trailing markdown code fence, with any or no language tag.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        // A fenced payload may also be embedded mid-prose.
        if let Some(start) = trimmed.find("```") {
            let inner = &trimmed[start + 3..];
            if let Some(end) = inner.find("```") {
                return strip_language_tag(&inner[..end]).to_string();
            }
        }
        return trimmed.to_string();
    };

    let body = match rest.rfind("```") {
        Some(end) => &rest[..end],
        None => rest,
    };
    strip_language_tag(body).to_string()
}

/// Drop a language tag (`json`, `javascript`, ...) on the first fence line.
fn strip_language_tag(body: &str) -> &str {
    match body.find('\n') {
        Some(newline) => {
            let first_line = body[..newline].trim();
            let is_tag = !first_line.is_empty()
                && first_line.len() <= 16
                && first_line.chars().all(|c| c.is_ascii_alphanumeric());
            if is_tag {
                &body[newline + 1..]
            } else {
                body
            }
        }
        None => body,
    }
}

/// Remove `//` line comments and `/* */` block comments outside of strings.
pub fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

/// Remove trailing commas before `}` or `]` outside of strings.
pub fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                i += 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Extract the first balanced `open..close` fragment, string-aware.
pub fn extract_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = start;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..=i]);
            }
        }
        i += 1;
    }

    None
}

/// Normalize an op name: lowercase, `-` replaced with `_`.
pub fn normalize_op(op: &str) -> String {
    op.trim().to_lowercase().replace('-', "_")
}

/// Flatten a graph-edit program payload into its operation objects.
///
/// Accepts a single object, a JSON array, or an object carrying an
/// `operations` array. An empty object is an empty program.
pub fn operations_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            if map.is_empty() {
                return Vec::new();
            }
            if let Some(Value::Array(items)) = map.get("operations") {
                return items.clone();
            }
            vec![Value::Object(map)]
        }
        _ => Vec::new(),
    }
}
