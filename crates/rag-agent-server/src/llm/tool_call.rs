use super::gateway::ToolSpec;
use super::provider::ToolInvocation;
use once_cell::sync::Lazy;
use regex::Regex;

/// Extract first JSON object substring from a possibly noisy LLM output.
/// Handles nested braces and braces inside JSON strings (with escapes).
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    let (start, end) = first_json_object_range(s)?;
    Some(&s[start..end])
}

fn first_json_object_range(s: &str) -> Option<(usize, usize)> {
    let mut start: Option<usize> = None;
    let mut depth: i32 = 0;

    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if start.is_none() {
            if ch == '{' {
                start = Some(i);
                depth = 1;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let st = start?;
                    return Some((st, i + ch.len_utf8()));
                }
            }
            _ => {}
        }
    }

    None
}

static TOOL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"TOOL:\s*([A-Za-z_][A-Za-z0-9_]*)\s*ARGS:").unwrap());

/// Fallback parser for providers without native tool calls: extracts a
/// `TOOL: name ARGS: {json}` directive from plain text. Returns the
/// invocation and the text with the directive removed.
pub fn parse_text_tool_call(text: &str) -> Option<(ToolInvocation, String)> {
    let captures = TOOL_PATTERN.captures(text)?;
    let full_match = captures.get(0)?;
    let name = captures.get(1)?.as_str().to_string();

    let tail = &text[full_match.end()..];
    let (json_start, json_end) = first_json_object_range(tail)?;
    let arguments: serde_json::Value = serde_json::from_str(&tail[json_start..json_end]).ok()?;

    let mut remaining = String::with_capacity(text.len());
    remaining.push_str(&text[..full_match.start()]);
    remaining.push_str(&tail[json_end..]);

    Some((
        ToolInvocation { name, arguments },
        remaining.trim().to_string(),
    ))
}

/// Instruction block appended to the system prompt for weak models so the
/// text fallback has a shape to parse.
pub fn build_tool_instructions(tools: &[ToolSpec]) -> String {
    let mut block = String::from(
        "\n\nYou can call tools. To call one, reply with EXACTLY one line in this form and nothing else:\n\
         TOOL: tool_name ARGS: {\"param\": \"value\"}\n\
         Available tools:\n",
    );

    for tool in tools {
        block.push_str(&format!(
            "- {}: {} Parameters: {}\n",
            tool.name,
            tool.description,
            serde_json::to_string(&tool.parameters).unwrap_or_else(|_| "{}".to_string())
        ));
    }

    block.push_str("When you have enough information, answer directly without the TOOL line.\n");
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_skips_noise() {
        let s = "Sure, here you go: {\"intent\": \"vector\"} hope that helps";
        assert_eq!(extract_first_json_object(s), Some("{\"intent\": \"vector\"}"));
    }

    #[test]
    fn test_extract_json_handles_nesting_and_strings() {
        let s = r#"prefix {"a": {"b": "br}ace"}, "c": 1} suffix"#;
        assert_eq!(
            extract_first_json_object(s),
            Some(r#"{"a": {"b": "br}ace"}, "c": 1}"#)
        );
    }

    #[test]
    fn test_extract_json_none_when_unbalanced() {
        assert_eq!(extract_first_json_object("{\"a\": 1"), None);
        assert_eq!(extract_first_json_object("no json here"), None);
    }

    #[test]
    fn test_parse_text_tool_call() {
        let text = r#"TOOL: vector_search ARGS: {"query": "masa berlaku PP 31/2013", "top_k": 5}"#;
        let (invocation, remaining) = parse_text_tool_call(text).unwrap();

        assert_eq!(invocation.name, "vector_search");
        assert_eq!(invocation.arguments["top_k"], json!(5));
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_parse_text_tool_call_keeps_surrounding_text() {
        let text = "Saya perlu cek dulu. TOOL: graph_traversal ARGS: {\"entity_name\": \"investor kitas\"} Sebentar.";
        let (invocation, remaining) = parse_text_tool_call(text).unwrap();

        assert_eq!(invocation.name, "graph_traversal");
        assert_eq!(remaining, "Saya perlu cek dulu.  Sebentar.".trim());
    }

    #[test]
    fn test_parse_text_tool_call_rejects_bad_json() {
        assert!(parse_text_tool_call("TOOL: calculator ARGS: not json").is_none());
    }

    #[test]
    fn test_no_tool_call_in_plain_answer() {
        assert!(parse_text_tool_call("Masa berlaku KITAS adalah 1 tahun.").is_none());
    }

    #[test]
    fn test_build_tool_instructions_lists_tools() {
        let tools = vec![ToolSpec {
            name: "calculator".into(),
            description: "Safe arithmetic.".into(),
            parameters: json!({"type": "object", "properties": {"expression": {"type": "string"}}}),
        }];
        let block = build_tool_instructions(&tools);
        assert!(block.contains("TOOL: tool_name ARGS:"));
        assert!(block.contains("- calculator: Safe arithmetic."));
    }
}
