//! Text tool protocol (CFP) for backends without usable native tool calling.
//!
//! Tool definitions are written into the system prompt and the model answers
//! with `<cfp>{"role":"call",...}</cfp>` blocks in plain text. [`CfpAdapter`]
//! wraps any [`BackendAdapter`]: requests are rewritten before the inner
//! adapter sees them, and reply text is scanned for blocks, which come back
//! out as ordinary tool calls.

use std::borrow::Cow;

use serde::Deserialize;
use serde_json::{json, Value};

use super::adapter::{BackendAdapter, ChunkEvent};
use super::anthropic_types::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse,
    ResponseContentBlock, StopReason, SystemContent, Tool,
};
use super::request::{tool_choice_mode, tool_result_to_string, ToolChoiceMode};
use super::response::{fallback_tool_id, recover_tool_arguments};
use crate::error::Result;
use crate::providers::Provider;

const OPEN_TAG: &str = "<cfp>";
const CLOSE_TAG: &str = "</cfp>";
const PROTOCOL_VERSION: u32 = 1;

const PROTOCOL_GUIDE: &str = "Tool calls use the Chat-Function-Protocol (CFP).\n\
To call a function, reply with ONLY one block per call:\n\
<cfp>{\"v\":1,\"role\":\"call\",\"id\":\"<unique id>\",\"name\":\"<function>\",\"args\":{...}}</cfp>\n\
Results come back as role=\"result\" blocks. Read them, then continue normally.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BlockRole {
    Call,
    Result,
    Error,
}

#[derive(Debug, Deserialize)]
struct Block {
    role: BlockRole,
    name: Option<String>,
    args: Option<Value>,
    result: Option<Value>,
    err: Option<String>,
}

fn encode(block: &Value) -> String {
    format!("{OPEN_TAG}{block}{CLOSE_TAG}")
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Move tools into the system prompt and tool turns into CFP text.
/// Requests without tools pass through untouched.
pub fn rewrite_request(req: &MessagesRequest) -> Result<Cow<'_, MessagesRequest>> {
    let Some(tools) = req.tools.as_ref().filter(|t| !t.is_empty()) else {
        return Ok(Cow::Borrowed(req));
    };
    let mode = tool_choice_mode(req)?;

    let mut sections = Vec::new();
    if let Some(system) = req.system.as_ref().map(SystemContent::as_text) {
        if !system.trim().is_empty() {
            sections.push(system);
        }
    }
    if mode != Some(ToolChoiceMode::None) {
        sections.push(tools_prompt(tools));
        sections.push(PROTOCOL_GUIDE.to_string());
        match mode {
            Some(ToolChoiceMode::Any) => {
                sections.push("You must call at least one function.".to_string());
            }
            Some(ToolChoiceMode::Tool(name)) => {
                sections.push(format!("You must call the function `{name}`."));
            }
            _ => {}
        }
    }

    let mut rewritten = req.clone();
    rewritten.system = Some(SystemContent::Text(sections.join("\n\n")));
    rewritten.messages = req.messages.iter().map(rewrite_message).collect();
    rewritten.tools = None;
    rewritten.tool_choice = None;
    Ok(Cow::Owned(rewritten))
}

fn tools_prompt(tools: &[Tool]) -> String {
    let mut prompt = String::from("Available functions:\n");
    for tool in tools {
        let parameters = serde_json::to_string_pretty(&tool.input_schema)
            .unwrap_or_else(|_| tool.input_schema.to_string());
        prompt.push_str(&format!("\n**{}**\n", tool.name));
        if let Some(description) = tool.description.as_deref() {
            prompt.push_str(&format!("Description: {description}\n"));
        }
        prompt.push_str(&format!("Parameters: {parameters}\n"));
    }
    prompt
}

fn rewrite_message(msg: &Message) -> Message {
    let content = match &msg.content {
        MessageContent::Text(_) => msg.content.clone(),
        MessageContent::Blocks(blocks) => {
            MessageContent::Blocks(blocks.iter().map(rewrite_block).collect())
        }
    };
    Message {
        role: msg.role,
        content,
    }
}

fn rewrite_block(block: &ContentBlock) -> ContentBlock {
    let text = match block {
        ContentBlock::ToolUse { id, name, input } => encode(&json!({
            "v": PROTOCOL_VERSION,
            "role": "call",
            "id": id,
            "name": name,
            "args": input,
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error: Some(true),
        } => encode(&json!({
            "v": PROTOCOL_VERSION,
            "role": "error",
            "id": tool_use_id,
            "err": tool_result_to_string(content.as_ref(), None),
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => encode(&json!({
            "v": PROTOCOL_VERSION,
            "role": "result",
            "id": tool_use_id,
            "result": tool_result_to_string(content.as_ref(), None),
        })),
        other => return other.clone(),
    };
    ContentBlock::Text { text }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Incremental scanner for `<cfp>` blocks in streamed text.
///
/// Text outside blocks is released as soon as it cannot be the start of an
/// opening tag. Each complete `call` block becomes one whole tool call on
/// its own slot. Blocks that do not parse are released as the original text.
#[derive(Debug, Default)]
pub struct CfpStreamParser {
    buffer: String,
    in_block: bool,
    calls: u64,
}

impl CfpStreamParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, text: &str) -> Vec<ChunkEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();

        loop {
            if self.in_block {
                let Some(end) = self.buffer.find(CLOSE_TAG) else {
                    break;
                };
                let body = self.buffer[..end].to_string();
                self.buffer.drain(..end + CLOSE_TAG.len());
                self.in_block = false;
                let event = self
                    .decode(&body)
                    .unwrap_or_else(|| ChunkEvent::Text(format!("{OPEN_TAG}{body}{CLOSE_TAG}")));
                push_event(&mut events, event);
            } else if let Some(start) = self.buffer.find(OPEN_TAG) {
                push_event(&mut events, ChunkEvent::Text(self.buffer[..start].to_string()));
                self.buffer.drain(..start + OPEN_TAG.len());
                self.in_block = true;
            } else {
                let release = self.buffer.len() - partial_tag_len(&self.buffer);
                push_event(&mut events, ChunkEvent::Text(self.buffer[..release].to_string()));
                self.buffer.drain(..release);
                break;
            }
        }

        events
    }

    /// Release everything still buffered. A block the model never closed
    /// still counts when its JSON is complete.
    pub fn flush(&mut self) -> Vec<ChunkEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let event = if std::mem::take(&mut self.in_block) {
            self.decode(&rest)
                .unwrap_or_else(|| ChunkEvent::Text(format!("{OPEN_TAG}{rest}")))
        } else {
            ChunkEvent::Text(rest)
        };
        let mut events = Vec::new();
        push_event(&mut events, event);
        events
    }

    #[must_use]
    pub fn saw_calls(&self) -> bool {
        self.calls > 0
    }

    fn decode(&mut self, body: &str) -> Option<ChunkEvent> {
        let block: Block = match serde_json::from_str(body.trim()) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(error = %e, "Keeping unparseable CFP block as text");
                return None;
            }
        };

        let event = match block.role {
            BlockRole::Call => {
                let name = block.name.filter(|n| !n.is_empty())?;
                let arguments = match block.args {
                    Some(Value::String(raw)) => raw,
                    Some(Value::Null) | None => "{}".to_string(),
                    Some(args) => args.to_string(),
                };
                let slot = self.calls;
                self.calls += 1;
                ChunkEvent::ToolCallFragment {
                    slot: Some(slot),
                    id: None,
                    name: Some(name),
                    arguments: Some(arguments),
                }
            }
            BlockRole::Result => ChunkEvent::Text(match block.result {
                Some(Value::String(text)) => text,
                Some(value) => value.to_string(),
                None => String::new(),
            }),
            BlockRole::Error => {
                ChunkEvent::Text(format!("[tool error] {}", block.err.unwrap_or_default()))
            }
        };
        Some(event)
    }
}

fn push_event(events: &mut Vec<ChunkEvent>, event: ChunkEvent) {
    if !matches!(&event, ChunkEvent::Text(text) if text.is_empty()) {
        events.push(event);
    }
}

/// Length of the longest suffix of `text` that could begin an opening tag.
fn partial_tag_len(text: &str) -> usize {
    (1..OPEN_TAG.len())
        .rev()
        .find(|&len| text.ends_with(&OPEN_TAG[..len]))
        .unwrap_or(0)
}

/// Turn `<cfp>` call blocks in a complete reply into tool_use blocks.
#[must_use]
pub fn extract_tool_calls(mut resp: MessagesResponse) -> MessagesResponse {
    let mut parser = CfpStreamParser::new();
    let mut content = Vec::with_capacity(resp.content.len());
    let mut text = String::new();

    for block in std::mem::take(&mut resp.content) {
        let ResponseContentBlock::Text { text: block_text } = block else {
            push_text(&mut content, &mut text);
            content.push(block);
            continue;
        };

        let mut events = parser.feed(&block_text);
        events.extend(parser.flush());
        for event in events {
            match event {
                ChunkEvent::Text(t) => text.push_str(&t),
                ChunkEvent::ToolCallFragment {
                    name, arguments, ..
                } => {
                    push_text(&mut content, &mut text);
                    let name = name.unwrap_or_default();
                    let input = recover_tool_arguments(&name, arguments.as_deref().unwrap_or("{}"));
                    content.push(ResponseContentBlock::ToolUse {
                        id: fallback_tool_id(&resp.id, content.len()),
                        name,
                        input,
                    });
                }
                _ => {}
            }
        }
    }
    push_text(&mut content, &mut text);

    if parser.saw_calls() && matches!(resp.stop_reason, None | Some(StopReason::EndTurn)) {
        resp.stop_reason = Some(StopReason::ToolUse);
    }
    resp.content = content;
    resp
}

fn push_text(content: &mut Vec<ResponseContentBlock>, text: &mut String) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: trimmed.to_string(),
        });
    }
    text.clear();
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Runs the text tool protocol on top of another backend adapter.
#[derive(Debug)]
pub struct CfpAdapter<A> {
    inner: A,
    parser: CfpStreamParser,
}

impl<A> CfpAdapter<A> {
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            parser: CfpStreamParser::new(),
        }
    }
}

impl<A: BackendAdapter> BackendAdapter for CfpAdapter<A> {
    type Request = A::Request;
    type Response = A::Response;
    type Chunk = A::Chunk;

    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn build_request(
        &self,
        req: &MessagesRequest,
        model: &str,
        max_tokens_cap: u64,
    ) -> Result<A::Request> {
        let rewritten = rewrite_request(req)?;
        self.inner.build_request(&rewritten, model, max_tokens_cap)
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String {
        self.inner.endpoint(base_url, model, stream)
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        self.inner.auth_header(api_key)
    }

    fn translate_response(&self, resp: &A::Response, original_model: &str) -> MessagesResponse {
        extract_tool_calls(self.inner.translate_response(resp, original_model))
    }

    fn chunk_events(&mut self, chunk: A::Chunk) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        for event in self.inner.chunk_events(chunk) {
            match event {
                ChunkEvent::Text(text) => events.extend(self.parser.feed(&text)),
                ChunkEvent::Finish(reason) => {
                    events.extend(self.parser.flush());
                    let reason = match reason {
                        StopReason::EndTurn if self.parser.saw_calls() => StopReason::ToolUse,
                        other => other,
                    };
                    events.push(ChunkEvent::Finish(reason));
                }
                ChunkEvent::Error(message) => {
                    events.extend(self.parser.flush());
                    events.push(ChunkEvent::Error(message));
                }
                other => events.push(other),
            }
        }
        events
    }

    fn flush(&mut self) -> Vec<ChunkEvent> {
        self.parser.flush()
    }
}
