//! Translation between the Anthropic Messages API and Gemini `generateContent`.
//!
//! Gemini keeps the system prompt in `systemInstruction`, calls the assistant
//! role `model`, and correlates tool results by function *name* rather than id.

use std::collections::HashMap;

use super::anthropic_types::{
    ContentBlock, MessagesRequest, MessagesResponse, ResponseContentBlock, Role, StopReason, Usage,
};
use super::gemini_types::{
    Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GeminiTool, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData,
    Part, ToolConfig,
};
use super::request::{message_text, tool_choice_mode, tool_result_to_string, ToolChoiceMode};
use super::response::{fallback_tool_id, message_id_from, new_message_id};
use crate::error::Result;

/// String formats Gemini accepts in tool parameter schemas.
const ALLOWED_STRING_FORMATS: &[&str] = &["enum", "date-time"];

/// Translate an Anthropic request into a Gemini `generateContent` request.
pub fn anthropic_to_gemini(req: &MessagesRequest, max_tokens_cap: u64) -> Result<GenerateContentRequest> {
    let tool_choice = tool_choice_mode(req)?;

    let mut system_parts: Vec<Part> = req
        .system
        .iter()
        .map(|s| Part::text(s.as_text()))
        .collect();

    // tool_use id -> function name, for functionResponse correlation
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::new();

    for msg in &req.messages {
        let role = match msg.role {
            Role::System => {
                system_parts.push(Part::text(message_text(&msg.content)));
                continue;
            }
            Role::User => "user",
            Role::Assistant => "model",
        };

        let blocks = msg.content.blocks();
        let mut parts = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let part = match block {
                ContentBlock::Text { text } => Part::text(text.clone()),
                ContentBlock::Image { source } => Part {
                    inline_data: Some(InlineData {
                        mime_type: source.media_type.clone(),
                        data: source.data.clone(),
                    }),
                    ..Part::default()
                },
                ContentBlock::ToolUse { id, name, input } => {
                    call_names.insert(id.clone(), name.clone());
                    Part {
                        function_call: Some(FunctionCall {
                            id: None,
                            name: name.clone(),
                            args: input.clone(),
                        }),
                        ..Part::default()
                    }
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let name = call_names
                        .get(tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    Part {
                        function_response: Some(FunctionResponse {
                            id: None,
                            name,
                            response: serde_json::json!({
                                "content": tool_result_to_string(content.as_ref(), *is_error)
                            }),
                        }),
                        ..Part::default()
                    }
                }
            };
            parts.push(part);
        }

        if parts.is_empty() {
            parts.push(Part::text(String::new()));
        }
        contents.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: clean_schema(t.input_schema.clone()),
                })
                .collect(),
        }]
    });

    let tool_config = tool_choice.filter(|_| tools.is_some()).map(|mode| {
        let (mode, allowed) = match mode {
            ToolChoiceMode::Auto => ("AUTO", None),
            ToolChoiceMode::Any => ("ANY", None),
            ToolChoiceMode::None => ("NONE", None),
            ToolChoiceMode::Tool(name) => ("ANY", Some(vec![name])),
        };
        ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            },
        }
    });

    let system_instruction = (!system_parts.is_empty()).then(|| Content {
        role: None,
        parts: system_parts,
    });

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config: Some(GenerationConfig {
            max_output_tokens: Some(req.max_tokens.min(max_tokens_cap)),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        }),
    })
}

/// Strip schema keywords Gemini rejects, recursively.
#[must_use]
pub fn clean_schema(schema: serde_json::Value) -> serde_json::Value {
    match schema {
        serde_json::Value::Object(mut map) => {
            map.remove("additionalProperties");
            map.remove("default");
            map.remove("$schema");

            let is_string = map.get("type").and_then(|t| t.as_str()) == Some("string");
            let format_allowed = map
                .get("format")
                .and_then(|f| f.as_str())
                .map_or(true, |f| ALLOWED_STRING_FORMATS.contains(&f));
            if is_string && !format_allowed {
                tracing::debug!(format = ?map.get("format"), "Dropping unsupported string format");
                map.remove("format");
            }

            serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, clean_schema(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(clean_schema).collect())
        }
        other => other,
    }
}

/// Translate a Gemini response into an Anthropic Messages response.
pub fn gemini_to_anthropic(resp: &GenerateContentResponse, original_model: &str) -> MessagesResponse {
    let id = resp
        .response_id
        .as_deref()
        .map_or_else(new_message_id, message_id_from);
    let candidate = resp.candidates.first();

    let mut text = String::new();
    let mut tool_blocks = Vec::new();
    for part in candidate
        .and_then(|c| c.content.as_ref())
        .map(|c| c.parts.as_slice())
        .unwrap_or_default()
    {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(ref t) = part.text {
            text.push_str(t);
        }
        if let Some(ref call) = part.function_call {
            tool_blocks.push(call);
        }
    }

    let mut content = Vec::with_capacity(tool_blocks.len() + 1);
    if !text.is_empty() {
        content.push(ResponseContentBlock::Text { text });
    }
    for call in &tool_blocks {
        let tool_id = call
            .id
            .clone()
            .unwrap_or_else(|| fallback_tool_id(&id, content.len()));
        content.push(ResponseContentBlock::ToolUse {
            id: tool_id,
            name: call.name.clone(),
            input: function_args(&call.args),
        });
    }
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = if tool_blocks.is_empty() {
        candidate
            .and_then(|c| c.finish_reason.as_deref())
            .map_or(StopReason::EndTurn, map_gemini_finish_reason)
    } else {
        StopReason::ToolUse
    };

    let usage = resp.usage_metadata.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_token_count.unwrap_or(0),
        output_tokens: u.candidates_token_count.unwrap_or(0),
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

/// Map Gemini finishReason to Anthropic stop_reason.
#[must_use]
pub fn map_gemini_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

/// Gemini sends structured args; anything but an object becomes `{}`.
pub(crate) fn function_args(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(_) => args.clone(),
        _ => serde_json::json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_system_and_roles() {
        let req = request(json!({
            "model": "gemini/gemini-2.5-pro",
            "max_tokens": 100000,
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));

        let result = anthropic_to_gemini(&req, 16384).unwrap();
        let system = result.system_instruction.unwrap();
        assert_eq!(system.parts[0].text.as_deref(), Some("be brief"));
        assert_eq!(result.contents[0].role.as_deref(), Some("user"));
        assert_eq!(result.contents[1].role.as_deref(), Some("model"));
        assert_eq!(
            result.generation_config.unwrap().max_output_tokens,
            Some(16384)
        );
    }

    #[test]
    fn test_function_response_recovers_name() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "sf"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"}
                ]}
            ]
        }));

        let result = anthropic_to_gemini(&req, 100).unwrap();
        let call = result.contents[0].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.args["city"], "sf");

        let response = result.contents[1].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response["content"], "sunny");
    }

    #[test]
    fn test_tool_choice_to_function_calling_config() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "ls", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "ls"}
        }));

        let config = anthropic_to_gemini(&req, 100).unwrap().tool_config.unwrap();
        assert_eq!(config.function_calling_config.mode, "ANY");
        assert_eq!(
            config.function_calling_config.allowed_function_names,
            Some(vec!["ls".to_string()])
        );
    }

    #[test]
    fn test_clean_schema() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "url": {"type": "string", "format": "uri"},
                "when": {"type": "string", "format": "date-time"},
                "tags": {"type": "array", "items": {"type": "string", "default": "x"}}
            }
        });

        assert_eq!(
            clean_schema(schema),
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "when": {"type": "string", "format": "date-time"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                }
            })
        );
    }

    #[test]
    fn test_gemini_response_with_function_calls() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "responseId": "abc",
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Checking."},
                    {"functionCall": {"name": "get_weather", "args": {"city": "sf"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5}
        }))
        .unwrap();

        let result = gemini_to_anthropic(&resp, "gemini/gemini-2.5-pro");
        assert_eq!(result.id, "msg_abc");
        assert_eq!(result.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(
            result.content,
            vec![
                ResponseContentBlock::Text {
                    text: "Checking.".to_string()
                },
                ResponseContentBlock::ToolUse {
                    id: "toolu_abc_1".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({"city": "sf"}),
                },
            ]
        );
        assert_eq!(result.usage.input_tokens, 12);
        assert_eq!(result.usage.output_tokens, 5);
    }

    #[test]
    fn test_gemini_response_without_usage() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "MAX_TOKENS"}]
        }))
        .unwrap();
        let result = gemini_to_anthropic(&resp, "m");
        assert_eq!(result.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(result.usage, Usage::default());
        assert!(result.id.starts_with("msg_"));
    }
}
