use serde_json::Value as JsonValue;

/// Pulls the generated text out of the response shapes of the common
/// completion APIs. Returns `None` when nothing non-empty is found.
pub fn extract_text(body: &JsonValue) -> Option<String> {
    let candidates = [
        // chat completions
        body.pointer("/choices/0/message/content")
            .and_then(content_text),
        // legacy completions
        body.pointer("/choices/0/text")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        // responses API
        body.get("output_text").and_then(content_text),
        body.get("output").and_then(output_items_text),
        // messages API
        body.get("content").and_then(content_text),
        // generateContent
        body.pointer("/candidates/0/content/parts")
            .and_then(content_text),
        body.get("text")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        body.get("completion")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    ];

    candidates
        .into_iter()
        .flatten()
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

/// A string, or a list of strings / `{text}` parts joined together.
fn content_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    JsonValue::String(text) => Some(text.as_str()),
                    JsonValue::Object(fields) => fields.get("text").and_then(JsonValue::as_str),
                    _ => None,
                })
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join(""))
            }
        }
        _ => None,
    }
}

fn output_items_text(value: &JsonValue) -> Option<String> {
    let items = value.as_array()?;
    let texts: Vec<String> = items
        .iter()
        .filter_map(|item| item.get("content").and_then(content_text))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_chat_completion() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "  calm blue  "}}]});
        assert_eq!(extract_text(&body).as_deref(), Some("calm blue"));
    }

    #[test]
    fn reads_legacy_completion() {
        let body = json!({"choices": [{"text": "airy grid"}]});
        assert_eq!(extract_text(&body).as_deref(), Some("airy grid"));
    }

    #[test]
    fn reads_responses_api_output() {
        let direct = json!({"output_text": "dense"});
        assert_eq!(extract_text(&direct).as_deref(), Some("dense"));

        let nested = json!({"output": [{"type": "message", "content": [{"type": "output_text", "text": "dense columns"}]}]});
        assert_eq!(extract_text(&nested).as_deref(), Some("dense columns"));
    }

    #[test]
    fn reads_messages_api_content_blocks() {
        let body = json!({"content": [{"type": "text", "text": "bold "}, {"type": "text", "text": "hero"}]});
        assert_eq!(extract_text(&body).as_deref(), Some("bold hero"));
    }

    #[test]
    fn reads_generate_content_parts() {
        let body = json!({"candidates": [{"content": {"parts": [{"text": "muted palette"}]}}]});
        assert_eq!(extract_text(&body).as_deref(), Some("muted palette"));
    }

    #[test]
    fn reads_plain_fields() {
        assert_eq!(extract_text(&json!({"text": "x"})).as_deref(), Some("x"));
        assert_eq!(extract_text(&json!({"completion": "y"})).as_deref(), Some("y"));
    }

    #[test]
    fn skips_empty_and_unknown_shapes() {
        assert_eq!(extract_text(&json!({"choices": [{"message": {"content": "   "}}]})), None);
        assert_eq!(extract_text(&json!({"result": "nope"})), None);
        assert_eq!(extract_text(&json!("bare string")), None);
    }
}
