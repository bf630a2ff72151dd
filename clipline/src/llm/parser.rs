//! Multi-strategy response parsing.
//!
//! Models frequently wrap structured output in prose or code fences. The
//! parser tries, in order: a direct parse, the first fenced code block, and
//! the first balanced brace/bracket region. Whatever parses is then checked
//! against the task's schema.

use serde_json::Value;

use super::LlmError;

/// Expected shape of a routed task's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSchema {
    /// Array of highlight objects.
    HighlightArray,
    /// Array of chapter objects.
    ChapterArray,
    /// Object mapping segment id (as a string key) to translated text.
    TranslationMap,
    /// Array of title strings.
    TitleArray,
    /// No structure expected; the raw text is the result.
    FreeText,
}

impl ResponseSchema {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseSchema::HighlightArray => "highlight_array",
            ResponseSchema::ChapterArray => "chapter_array",
            ResponseSchema::TranslationMap => "translation_map",
            ResponseSchema::TitleArray => "title_array",
            ResponseSchema::FreeText => "free_text",
        }
    }
}

/// Parse text into JSON using the strategy ladder.
pub fn parse_structured(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(value);
        }
    }

    if let Some(region) = extract_balanced_region(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(region) {
            return Ok(value);
        }
    }

    Err(LlmError::ParseFailure {
        reason: "no parseable structured data found".to_string(),
    })
}

/// Parse and schema-check in one step.
pub fn parse_and_validate(text: &str, schema: ResponseSchema) -> Result<Value, LlmError> {
    if schema == ResponseSchema::FreeText {
        return Ok(Value::String(text.trim().to_string()));
    }
    let value = parse_structured(text)?;
    validate(schema, &value)?;
    Ok(value)
}

/// Validate parsed JSON against a task schema.
pub fn validate(schema: ResponseSchema, value: &Value) -> Result<(), LlmError> {
    let fail = |reason: String| LlmError::SchemaFailure {
        schema: schema.name(),
        reason,
    };

    match schema {
        ResponseSchema::FreeText => Ok(()),
        ResponseSchema::HighlightArray => {
            let items = value
                .as_array()
                .ok_or_else(|| fail("expected an array".into()))?;
            for (i, item) in items.iter().enumerate() {
                let obj = item
                    .as_object()
                    .ok_or_else(|| fail(format!("element {i} is not an object")))?;
                let start = require_u64(obj, "start_segment_id")
                    .map_err(|r| fail(format!("element {i}: {r}")))?;
                let end = require_u64(obj, "end_segment_id")
                    .map_err(|r| fail(format!("element {i}: {r}")))?;
                if end < start {
                    return Err(fail(format!(
                        "element {i}: end_segment_id {end} precedes start_segment_id {start}"
                    )));
                }
                let score = require_u64(obj, "score")
                    .map_err(|r| fail(format!("element {i}: {r}")))?;
                if score > 100 {
                    return Err(fail(format!("element {i}: score {score} out of range")));
                }
            }
            Ok(())
        }
        ResponseSchema::ChapterArray => {
            let items = value
                .as_array()
                .ok_or_else(|| fail("expected an array".into()))?;
            for (i, item) in items.iter().enumerate() {
                let obj = item
                    .as_object()
                    .ok_or_else(|| fail(format!("element {i} is not an object")))?;
                let start = require_f64(obj, "start_s")
                    .map_err(|r| fail(format!("element {i}: {r}")))?;
                let end = require_f64(obj, "end_s")
                    .map_err(|r| fail(format!("element {i}: {r}")))?;
                if end < start {
                    return Err(fail(format!("element {i}: end_s precedes start_s")));
                }
                if !obj.get("title").map(Value::is_string).unwrap_or(false) {
                    return Err(fail(format!("element {i}: missing string title")));
                }
            }
            Ok(())
        }
        ResponseSchema::TranslationMap => {
            let map = value
                .as_object()
                .ok_or_else(|| fail("expected an object".into()))?;
            for (key, val) in map {
                if key.parse::<u32>().is_err() {
                    return Err(fail(format!("key `{key}` is not a segment id")));
                }
                if !val.is_string() {
                    return Err(fail(format!("value for `{key}` is not a string")));
                }
            }
            Ok(())
        }
        ResponseSchema::TitleArray => {
            let items = value
                .as_array()
                .ok_or_else(|| fail("expected an array".into()))?;
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    return Err(fail(format!("element {i} is not a string")));
                }
            }
            Ok(())
        }
    }
}

fn require_u64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<u64, String> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing numeric `{key}`"))
}

fn require_f64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<f64, String> {
    obj.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric `{key}`"))
}

/// First fenced code block, preferring a `json`-labelled fence.
fn extract_fenced_block(text: &str) -> Option<&str> {
    for opener in ["```json", "```"] {
        if let Some(start) = text.find(opener) {
            let body_start = start + opener.len();
            let body = &text[body_start..];
            // Skip a language label on a bare fence.
            let body = match body.find('\n') {
                Some(nl) if opener == "```" => &body[nl + 1..],
                _ => body,
            };
            if let Some(end) = body.find("```") {
                return Some(&body[..end]);
            }
        }
    }
    None
}

/// First balanced `{...}` or `[...]` region, honoring string literals.
fn extract_balanced_region(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse() {
        let value = parse_structured(r#"[{"a": 1}]"#).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_fenced_block_parse() {
        let text = "Here you go:\n```json\n[1, 2, 3]\n```\nEnjoy!";
        let value = parse_structured(text).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn test_bare_fence_with_label() {
        let text = "```javascript\n{\"k\": \"v\"}\n```";
        let value = parse_structured(text).unwrap();
        assert_eq!(value, json!({"k": "v"}));
    }

    #[test]
    fn test_balanced_region_parse() {
        let text = "The chapters are [{\"start_s\": 0, \"end_s\": 5, \"title\": \"Intro\"}] as requested.";
        let value = parse_structured(text).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"result: {"text": "set {braces} ok"} trailing"#;
        let value = parse_structured(text).unwrap();
        assert_eq!(value["text"], "set {braces} ok");
    }

    #[test]
    fn test_unparseable_is_parse_failure() {
        let err = parse_structured("no structure here").err().unwrap();
        assert!(matches!(err, LlmError::ParseFailure { .. }));
    }

    #[test]
    fn test_highlight_schema_accepts_valid() {
        let value = json!([{
            "start_segment_id": 1,
            "end_segment_id": 3,
            "score": 80,
            "reason": "funny",
            "category": "funny",
            "suggested_title": "t"
        }]);
        assert!(validate(ResponseSchema::HighlightArray, &value).is_ok());
    }

    #[test]
    fn test_highlight_schema_rejects_inverted_span() {
        let value = json!([{
            "start_segment_id": 5,
            "end_segment_id": 3,
            "score": 80
        }]);
        let err = validate(ResponseSchema::HighlightArray, &value).err().unwrap();
        assert!(matches!(err, LlmError::SchemaFailure { .. }));
    }

    #[test]
    fn test_highlight_schema_rejects_score_out_of_range() {
        let value = json!([{
            "start_segment_id": 1,
            "end_segment_id": 3,
            "score": 120
        }]);
        assert!(validate(ResponseSchema::HighlightArray, &value).is_err());
    }

    #[test]
    fn test_translation_map_schema() {
        let good = json!({"1": "こんにちは", "2": "世界"});
        assert!(validate(ResponseSchema::TranslationMap, &good).is_ok());

        let bad_key = json!({"one": "hello"});
        assert!(validate(ResponseSchema::TranslationMap, &bad_key).is_err());

        let bad_value = json!({"1": 42});
        assert!(validate(ResponseSchema::TranslationMap, &bad_value).is_err());
    }

    #[test]
    fn test_free_text_passthrough() {
        let value = parse_and_validate("  plain answer  ", ResponseSchema::FreeText).unwrap();
        assert_eq!(value, json!("plain answer"));
    }
}
