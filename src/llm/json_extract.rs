//! Lenient extraction of a JSON object from LLM output.
//!
//! Every stage handler that consumes model output goes through
//! [`extract_json_object`]. Strategy: strip Markdown code fences, locate
//! the first balanced `{…}` substring (string- and escape-aware), parse;
//! on failure run one repair pass (trailing commas removed, unterminated
//! strings and unclosed delimiters closed); a second failure or a
//! non-object result is an error.

use serde_json::Value;

/// Errors from lenient JSON extraction.
#[derive(Debug, thiserror::Error)]
pub enum JsonExtractError {
    /// The output contains no `{` at all.
    #[error("model output contains no JSON object")]
    NoObject,
    /// The output is not an object even after repair.
    #[error("model output is not a JSON object: {0}")]
    Invalid(String),
}

/// Extract the first JSON object from raw model output.
///
/// # Errors
///
/// Returns [`JsonExtractError`] when no object can be recovered.
pub fn extract_json_object(raw: &str) -> Result<Value, JsonExtractError> {
    let stripped = strip_code_fences(raw);

    let candidate = match balanced_object_slice(stripped) {
        Some(slice) => slice.to_owned(),
        // No balanced object — maybe truncated output. Take everything
        // from the first brace and let the repair pass close it.
        None => {
            let start = stripped.find('{').ok_or(JsonExtractError::NoObject)?;
            stripped
                .get(start..)
                .ok_or(JsonExtractError::NoObject)?
                .to_owned()
        }
    };

    match serde_json::from_str::<Value>(&candidate) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(value) => Err(JsonExtractError::Invalid(format!(
            "expected object, got {}",
            json_type_name(&value)
        ))),
        Err(first_error) => {
            let repaired = repair(&candidate);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) if value.is_object() => Ok(value),
                _ => Err(JsonExtractError::Invalid(first_error.to_string())),
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Drop a leading ```` ``` ```` (optionally ```` ```json ````) fence line
/// and a trailing fence line, when both are present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json", "JSON", ...) up to the first newline.
    let Some(newline) = rest.find('\n') else {
        return trimmed;
    };
    let body = &rest[newline.saturating_add(1)..];
    body.strip_suffix("```").map_or(body, str::trim).trim()
}

/// Find the first balanced `{…}` slice, honouring strings and escapes.
fn balanced_object_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: u32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth = depth.saturating_add(1),
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start.saturating_add(offset).saturating_add(c.len_utf8());
                    return text.get(start..end);
                }
            }
            _ => {}
        }
    }
    None
}

/// One-shot JSON repair: drop trailing commas, terminate a dangling
/// string, and close unclosed braces/brackets in reverse order.
fn repair(candidate: &str) -> String {
    let without_trailing_commas = remove_trailing_commas(candidate);

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in without_trailing_commas.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = without_trailing_commas;
    if in_string {
        repaired.push('"');
    }
    // A repaired fragment often ends mid-value after a comma or colon.
    while repaired
        .trim_end()
        .ends_with(|c| c == ',' || c == ':')
    {
        repaired.truncate(repaired.trim_end().len().saturating_sub(1));
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Remove `,` immediately preceding a closing delimiter, outside strings.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '}' | ']' => {
                // Drop any comma (plus whitespace) we just emitted.
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    out.truncate(trimmed_len.saturating_sub(1));
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
