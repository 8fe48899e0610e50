//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! Handles system messages, multi-part content (text, images), tool use, tool results,
//! and tool choice mapping. A single Anthropic message can expand into multiple `OpenAI`
//! messages (e.g. a user message with `tool_result` blocks becomes separate `tool`-role messages).
//!
//! The tool-result flattening and tool-choice validation here are shared with the
//! Gemini translator.

use super::anthropic_types::{
    ContentBlock, Message, MessageContent, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart, ImageUrlDetail, StreamOptions,
};
use crate::error::{ProxyError, Result};

/// A validated `tool_choice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoiceMode {
    Auto,
    Any,
    None,
    Tool(String),
}

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
/// Pure function: `model` is the backend model id (provider prefix already removed)
/// and `max_tokens_cap` the ceiling `max_tokens` is clamped to.
pub fn anthropic_to_openai(
    req: &MessagesRequest,
    model: &str,
    max_tokens_cap: u64,
) -> Result<ChatCompletionRequest> {
    let tool_choice = tool_choice_mode(req)?;

    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        messages.push(text_message("system", system.as_text()));
    }

    for msg in &req.messages {
        let mut translated = translate_message(msg);
        messages.append(&mut translated);
    }

    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    let parallel_tool_calls = req
        .tool_choice
        .as_ref()
        .and_then(|tc| tc.disable_parallel_tool_use)
        .filter(|disabled| *disabled && tools.is_some())
        .map(|_| false);

    let stream_options = req.stream.filter(|s| *s).map(|_| StreamOptions {
        include_usage: true,
    });

    let max_tokens = req.max_tokens.min(max_tokens_cap);
    let (max_tokens, max_completion_tokens) = if is_reasoning_model(model) {
        (None, Some(max_tokens))
    } else {
        (Some(max_tokens), None)
    };

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        max_tokens,
        max_completion_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options,
        tool_choice: tool_choice
            .filter(|_| tools.is_some())
            .map(translate_tool_choice),
        tools,
        parallel_tool_calls,
        stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        user,
    })
}

/// o-series models take `max_completion_tokens` instead of `max_tokens`.
fn is_reasoning_model(model: &str) -> bool {
    ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p))
}

fn text_message(role: &str, text: String) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content: Some(ChatContent::Text(text)),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    }
}

/// A single Anthropic message can expand to multiple `OpenAI` messages
/// (e.g. a user message with `tool_results` becomes separate tool-role messages).
fn translate_message(msg: &Message) -> Vec<ChatMessage> {
    match (&msg.role, &msg.content) {
        (Role::System, content) => vec![text_message("system", message_text(content))],
        (Role::User, content) => translate_user_message(&content.blocks()),
        (Role::Assistant, content) => translate_assistant_message(&content.blocks()),
    }
}

/// Concatenated text blocks of a message.
pub(crate) fn message_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn translate_user_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => {
                let data_uri = format!("data:{};base64,{}", source.media_type, source.data);
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: data_uri,
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Flush any accumulated content parts as a user message first
                if !content_parts.is_empty() {
                    messages.push(ChatMessage {
                        role: "user".to_string(),
                        content: Some(collapse_content_parts(&content_parts)),
                        tool_calls: None,
                        tool_call_id: None,
                        name: None,
                    });
                    content_parts.clear();
                }

                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(tool_result_to_string(
                        content.as_ref(),
                        *is_error,
                    ))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
            ContentBlock::ToolUse { .. } => {}
        }
    }

    if !content_parts.is_empty() {
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(collapse_content_parts(&content_parts)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }

    // If nothing was produced (empty message), emit an empty user message
    if messages.is_empty() {
        messages.push(text_message("user", String::new()));
    }

    messages
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                text_parts.push(text.clone());
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    // OpenAI rejects an assistant turn with neither content nor tool calls.
    let content = if text_parts.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text_parts.join("")))
    };

    let tool_calls_opt = if tool_calls.is_empty() {
        None
    } else {
        Some(tool_calls)
    };

    vec![ChatMessage {
        role: "assistant".to_string(),
        content,
        tool_calls: tool_calls_opt,
        tool_call_id: None,
        name: None,
    }]
}

fn collapse_content_parts(parts: &[ContentPart]) -> ChatContent {
    if parts.len() == 1 {
        if let ContentPart::Text { text } = &parts[0] {
            return ChatContent::Text(text.clone());
        }
    }
    ChatContent::Parts(parts.to_vec())
}

/// Flatten a tool result into the single string both backends expect.
pub(crate) fn tool_result_to_string(
    content: Option<&ToolResultContent>,
    is_error: Option<bool>,
) -> String {
    let prefix = if is_error == Some(true) {
        "ERROR: "
    } else {
        ""
    };

    let text = match content {
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Json(serde_json::Value::Null)) | None => {
            "No content provided".to_string()
        }
        Some(ToolResultContent::Json(serde_json::Value::Array(items))) => items
            .iter()
            .map(json_item_text)
            .collect::<Vec<_>>()
            .join("\n"),
        Some(ToolResultContent::Json(value)) => json_item_text(value),
    };

    format!("{prefix}{text}")
}

fn json_item_text(item: &serde_json::Value) -> String {
    match item {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => match map.get("text").and_then(|t| t.as_str()) {
            Some(text) if map.get("type").map_or(true, |t| t == "text") => text.to_string(),
            _ => item.to_string(),
        },
        other => other.to_string(),
    }
}

/// Validate `tool_choice` against the declared tools.
pub(crate) fn tool_choice_mode(req: &MessagesRequest) -> Result<Option<ToolChoiceMode>> {
    let Some(tc) = req.tool_choice.as_ref() else {
        return Ok(None);
    };
    Ok(Some(match tc.choice_type.as_str() {
        "any" => ToolChoiceMode::Any,
        "none" => ToolChoiceMode::None,
        "tool" => ToolChoiceMode::Tool(named_tool(req, tc)?),
        _ => ToolChoiceMode::Auto,
    }))
}

fn named_tool(req: &MessagesRequest, tc: &ToolChoice) -> Result<String> {
    let name = tc
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProxyError::translation("tool_choice of type 'tool' requires a name"))?;

    let declared = req
        .tools
        .as_ref()
        .is_some_and(|tools| tools.iter().any(|t| t.name == name));
    if !declared {
        return Err(ProxyError::translation(format!(
            "tool_choice names undeclared tool '{name}'"
        )));
    }
    Ok(name.to_string())
}

fn translate_tool_choice(mode: ToolChoiceMode) -> ChatToolChoice {
    match mode {
        ToolChoiceMode::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoiceMode::Any => ChatToolChoice::String("required".to_string()),
        ToolChoiceMode::None => ChatToolChoice::String("none".to_string()),
        ToolChoiceMode::Tool(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name },
        }),
    }
}

/// Rough input token count: about four characters per token over message
/// text, system prompt and tool definitions. Never below 1.
#[must_use]
pub fn estimate_input_tokens(req: &MessagesRequest) -> u64 {
    let mut chars = req.system.as_ref().map_or(0, |s| s.as_text().len());

    for msg in &req.messages {
        for block in msg.content.blocks() {
            chars += match block {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => tool_result_to_string(content.as_ref(), is_error).len(),
                ContentBlock::Image { .. } => 0,
            };
        }
    }

    for tool in req.tools.iter().flatten() {
        chars += tool.name.len()
            + tool.description.as_ref().map_or(0, String::len)
            + tool.input_schema.to_string().len();
    }

    (chars as u64 / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_simple_text_request() {
        let req = request(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "Hello"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048}
        }));

        let result = anthropic_to_openai(&req, "gpt-4o", 16384).unwrap();

        assert_eq!(result.model, "gpt-4o");
        assert_eq!(result.messages.len(), 2); // system + user
        assert_eq!(result.messages[0].role, "system");
        assert_eq!(result.messages[1].role, "user");
        assert_eq!(result.max_tokens, Some(1024));

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn test_tool_result_splits_into_tool_messages() {
        let req = request(json!({
            "model": "test",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "result 1"},
                {"type": "text", "text": "Now continue"}
            ]}]
        }));

        let result = anthropic_to_openai(&req, "gpt-4o", 16384).unwrap();

        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].role, "tool");
        assert_eq!(result.messages[0].tool_call_id, Some("toolu_1".to_string()));
        assert_eq!(result.messages[1].role, "user");
    }

    #[test]
    fn test_assistant_tool_use_becomes_compact_tool_call() {
        let req = request(json!({
            "model": "test",
            "max_tokens": 10,
            "messages": [{"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_9", "name": "get_weather",
                 "input": {"city": "sf", "units": "c"}}
            ]}]
        }));

        let result = anthropic_to_openai(&req, "gpt-4o", 16384).unwrap();
        let msg = &result.messages[0];
        assert!(msg.content.is_none());
        let call = &msg.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_9");
        assert_eq!(call.function.arguments, r#"{"city":"sf","units":"c"}"#);
    }

    #[test]
    fn test_max_tokens_capped_and_renamed_for_reasoning_models() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 64000,
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let result = anthropic_to_openai(&req, "gpt-4.1", 16384).unwrap();
        assert_eq!(result.max_tokens, Some(16384));
        assert_eq!(result.max_completion_tokens, None);

        let result = anthropic_to_openai(&req, "o3-mini", 16384).unwrap();
        assert_eq!(result.max_tokens, None);
        assert_eq!(result.max_completion_tokens, Some(16384));
    }

    #[test]
    fn test_tool_choice_mapping() {
        let base = json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "ls", "input_schema": {"type": "object"}}]
        });

        let with_choice = |choice: serde_json::Value| {
            let mut value = base.clone();
            value["tool_choice"] = choice;
            anthropic_to_openai(&request(value), "gpt-4o", 100)
        };

        let result = with_choice(json!({"type": "any"})).unwrap();
        assert!(matches!(result.tool_choice, Some(ChatToolChoice::String(ref s)) if s == "required"));

        let result = with_choice(json!({"type": "tool", "name": "ls"})).unwrap();
        assert!(
            matches!(result.tool_choice, Some(ChatToolChoice::Specific(ref s)) if s.function.name == "ls")
        );

        let result = with_choice(json!({"type": "auto", "disable_parallel_tool_use": true})).unwrap();
        assert_eq!(result.parallel_tool_calls, Some(false));

        let result = with_choice(json!({"type": "something_new"})).unwrap();
        assert!(matches!(result.tool_choice, Some(ChatToolChoice::String(ref s)) if s == "auto"));

        let err = with_choice(json!({"type": "tool", "name": "rm"})).unwrap_err();
        assert!(matches!(err, ProxyError::Translation { .. }));
        let err = with_choice(json!({"type": "tool"})).unwrap_err();
        assert!(matches!(err, ProxyError::Translation { .. }));
    }

    #[test]
    fn test_tool_result_flattening() {
        let list = ToolResultContent::Json(json!([
            {"type": "text", "text": "line one"},
            "line two",
            {"type": "image", "source": {"data": "x"}}
        ]));
        assert_eq!(
            tool_result_to_string(Some(&list), None),
            "line one\nline two\n{\"source\":{\"data\":\"x\"},\"type\":\"image\"}"
        );

        let text = ToolResultContent::Text("boom".to_string());
        assert_eq!(tool_result_to_string(Some(&text), Some(true)), "ERROR: boom");

        let object = ToolResultContent::Json(json!({"exit": 0}));
        assert_eq!(tool_result_to_string(Some(&object), None), "{\"exit\":0}");

        assert_eq!(tool_result_to_string(None, None), "No content provided");
    }

    #[test]
    fn test_system_role_message_passes_through() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "hi"}
            ]
        }));
        let result = anthropic_to_openai(&req, "gpt-4o", 100).unwrap();
        assert_eq!(result.messages[0].role, "system");
        assert!(matches!(result.messages[0].content, Some(ChatContent::Text(ref t)) if t == "rules"));
    }

    #[test]
    fn test_estimate_input_tokens() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "abcdefghijklmnop"}]
        }));
        assert_eq!(estimate_input_tokens(&req), 4);

        let empty = request(json!({"model": "m", "max_tokens": 1, "messages": []}));
        assert_eq!(estimate_input_tokens(&empty), 1);
    }
}
