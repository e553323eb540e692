use serde_json::Value;

use crate::error::PipelineError;

const PREVIEW_CHARS: usize = 200;

/// Recover a JSON value from noisy generated text.
///
/// Attempts, first success wins:
/// 1. parse the trimmed text directly
/// 2. strip a fenced-code wrapper and parse the body
/// 3. parse the first balanced `{...}` / `[...]` span
/// 4. normalize smart quotes in that span and parse again
/// 5. with no balanced span, normalize the whole text and parse it
///
/// Steps 3 to 5 run on the fence body first, then on the raw text.
pub fn parse_generated_json(raw: &str) -> Result<Value, PipelineError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let clean = strip_code_fence(trimmed);
    if clean != trimmed {
        if let Ok(value) = serde_json::from_str::<Value>(clean) {
            return Ok(value);
        }
        if let Some(value) = recover_embedded(clean) {
            return Ok(value);
        }
    }

    recover_embedded(trimmed).ok_or_else(|| PipelineError::MalformedOutput {
        preview: preview(raw),
    })
}

fn recover_embedded(text: &str) -> Option<Value> {
    match find_balanced_span(text) {
        Some(span) => serde_json::from_str::<Value>(span)
            .or_else(|_| serde_json::from_str::<Value>(&normalize_quotes(span)))
            .ok(),
        None => serde_json::from_str::<Value>(&normalize_quotes(text)).ok(),
    }
}

/// Strip one fenced-code wrapper, with or without a language tag.
///
/// The opening fence must end its line and the closing fence must start
/// one. JSON strings cannot hold a raw newline, so a fence quoted inside a
/// string value never matches.
fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };

    let after_open = &text[open + 3..];
    let Some(newline) = after_open.find('\n') else {
        return text;
    };
    // Language tag line ("json", "JSON", ...)
    if !after_open[..newline]
        .trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric())
    {
        return text;
    }
    let body = &after_open[newline + 1..];

    match body.rfind("```") {
        Some(close) if body[..close].ends_with('\n') => body[..close].trim(),
        Some(_) => text,
        None => body.trim(),
    }
}

/// Find the first top-level bracketed span.
///
/// Single pass with a depth counter; characters inside double-quoted strings
/// (respecting backslash escapes) do not affect depth.
fn find_balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Replace typographic quotes with their ASCII forms
fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect()
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        trimmed.to_string()
    } else {
        let prefix: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", prefix)
    }
}
