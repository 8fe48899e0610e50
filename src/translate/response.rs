//! Translate `OpenAI` Chat Completions responses into Anthropic Messages responses.

use super::anthropic_types::{MessagesResponse, ResponseContentBlock, StopReason, Usage};
use super::openai_types::ChatCompletionResponse;
use crate::error::{ProxyError, Result};

/// Translate an OpenAI Chat Completion response into an Anthropic Messages response.
/// Pure function: `original_model` is the model string the client sent.
pub fn openai_to_anthropic(resp: &ChatCompletionResponse, original_model: &str) -> MessagesResponse {
    let choice = resp.choices.first();
    let id = message_id_from(&resp.id);

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(c) = choice {
        if let Some(ref text) = c.message.content {
            if !text.is_empty() {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }
        }

        for tc in c.message.tool_calls.iter().flatten() {
            let tool_id = if tc.id.is_empty() {
                fallback_tool_id(&id, content.len())
            } else {
                tc.id.clone()
            };
            content.push(ResponseContentBlock::ToolUse {
                id: tool_id,
                name: tc.function.name.clone(),
                input: recover_tool_arguments(&tc.function.name, &tc.function.arguments),
            });
        }
    }

    // Ensure at least one content block (Claude Code expects non-empty content)
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map_or(StopReason::EndTurn, map_finish_reason);

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    });

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

/// Map OpenAI finish_reason to Anthropic stop_reason. Unknown values end the turn.
#[must_use]
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Parse a backend's JSON-string tool arguments into an input object.
/// An empty string is an empty object.
pub fn parse_tool_arguments(tool: &str, arguments: &str) -> Result<serde_json::Value> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(other) => Err(ProxyError::malformed_tool_arguments(
            tool,
            format!("expected a JSON object, got {other}"),
        )),
        Err(e) => Err(ProxyError::malformed_tool_arguments(tool, e.to_string())),
    }
}

/// [`parse_tool_arguments`], falling back to an empty object.
pub(crate) fn recover_tool_arguments(tool: &str, arguments: &str) -> serde_json::Value {
    parse_tool_arguments(tool, arguments).unwrap_or_else(|e| {
        tracing::warn!(tool = %tool, error = %e, "Using empty tool input");
        serde_json::json!({})
    })
}

/// Anthropic-style message id for a backend response id.
pub(crate) fn message_id_from(backend_id: &str) -> String {
    let id = backend_id.trim_start_matches("chatcmpl-");
    if id.is_empty() {
        new_message_id()
    } else {
        format!("msg_{id}")
    }
}

#[must_use]
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Tool id for backends that do not assign one. Deterministic in the
/// message id and block index.
pub(crate) fn fallback_tool_id(message_id: &str, index: usize) -> String {
    let suffix = message_id.strip_prefix("msg_").unwrap_or(message_id);
    format!("toolu_{suffix}_{index}")
}
