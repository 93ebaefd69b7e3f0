//! Shared utility functions for the batchpilot crate.

use chrono::{DateTime, Utc};

/// Strip markdown code fences wrapped around a JSON payload.
///
/// LLMs routinely wrap structured output in ` ```json ... ``` ` or plain
/// ` ``` ... ``` ` fences. Returns the inner text when the whole payload is a
/// single fenced block, otherwise the input unchanged. The caller is
/// responsible for preserving the original text as `raw_response` before
/// calling this.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an optional language tag on the opening fence line.
    let body = match body.split_once('\n') {
        Some((first_line, remainder))
            if first_line
                .trim()
                .chars()
                .all(|c| c.is_ascii_alphanumeric()) =>
        {
            remainder
        }
        _ => body,
    };
    body.trim()
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Format a timestamp the way every persisted artifact expects it.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Human-readable duration for log lines: "42s", "3m12s", "1h04m".
pub fn human_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences_json_tag() {
        let text = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_markdown_fences(text), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_fences_bare() {
        let text = "```\n{\"key\": 1}\n```";
        assert_eq!(strip_markdown_fences(text), "{\"key\": 1}");
    }

    #[test]
    fn test_strip_fences_unfenced_passthrough() {
        let text = "{\"key\": 1}";
        assert_eq!(strip_markdown_fences(text), text);
    }

    #[test]
    fn test_strip_fences_partial_fence_untouched() {
        let text = "```json\n{\"key\": 1}";
        assert_eq!(strip_markdown_fences(text), text);
    }

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_brace_inside_string() {
        let text = r#"{"key": "has } brace"}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(42), "42s");
        assert_eq!(human_duration(192), "3m12s");
        assert_eq!(human_duration(3840), "1h04m");
    }
}
