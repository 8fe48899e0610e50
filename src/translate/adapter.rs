//! Per-provider adapters.
//!
//! A [`BackendAdapter`] owns everything that differs between backend wire
//! protocols: request construction, endpoint and auth, non-streaming response
//! translation, and decoding of stream chunks into backend-agnostic
//! [`ChunkEvent`]s. The [`StreamTranslator`](super::streaming::StreamTranslator)
//! only ever sees `ChunkEvent`s, so a new provider never touches it.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::anthropic_types::{MessagesRequest, MessagesResponse, StopReason};
use super::gemini::{anthropic_to_gemini, function_args, gemini_to_anthropic, map_gemini_finish_reason};
use super::gemini_types::{GenerateContentRequest, GenerateContentResponse};
use super::openai_types::{ChatCompletionRequest, ChatCompletionResponse, ChatStreamPayload};
use super::request::anthropic_to_openai;
use super::response::{map_finish_reason, openai_to_anthropic};
use crate::error::Result;
use crate::providers::Provider;

/// One backend-agnostic unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Text(String),
    /// Part of a tool call. `slot` identifies the call within the response;
    /// a fragment without one continues the most recent call unless it
    /// carries a new `id`.
    ToolCallFragment {
        slot: Option<u64>,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Running totals; later values replace earlier ones.
    Usage {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    Finish(StopReason),
    /// The backend reported a failure inside the stream.
    Error(String),
}

pub trait BackendAdapter: Send {
    type Request: Serialize + Send + Sync;
    type Response: DeserializeOwned;
    type Chunk: DeserializeOwned + Send;

    fn provider(&self) -> Provider;

    /// Build the backend request. `model` has no provider prefix.
    fn build_request(
        &self,
        req: &MessagesRequest,
        model: &str,
        max_tokens_cap: u64,
    ) -> Result<Self::Request>;

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String;

    /// Header name and value carrying the api key.
    fn auth_header(&self, api_key: &str) -> (&'static str, String);

    fn translate_response(&self, resp: &Self::Response, original_model: &str) -> MessagesResponse;

    /// Decode one stream chunk. Adapters may keep state across chunks.
    fn chunk_events(&mut self, chunk: Self::Chunk) -> Vec<ChunkEvent>;

    /// Events still held back when the backend stream ends without a
    /// finish marker.
    fn flush(&mut self) -> Vec<ChunkEvent> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl BackendAdapter for OpenAiAdapter {
    type Request = ChatCompletionRequest;
    type Response = ChatCompletionResponse;
    type Chunk = ChatStreamPayload;

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn build_request(
        &self,
        req: &MessagesRequest,
        model: &str,
        max_tokens_cap: u64,
    ) -> Result<ChatCompletionRequest> {
        anthropic_to_openai(req, model, max_tokens_cap)
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("authorization", format!("Bearer {api_key}"))
    }

    fn translate_response(&self, resp: &ChatCompletionResponse, original_model: &str) -> MessagesResponse {
        openai_to_anthropic(resp, original_model)
    }

    fn chunk_events(&mut self, chunk: ChatStreamPayload) -> Vec<ChunkEvent> {
        let chunk = match chunk {
            ChatStreamPayload::Error(err) => return vec![ChunkEvent::Error(err.error.message)],
            ChatStreamPayload::Chunk(chunk) => chunk,
        };

        let mut events = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(ChunkEvent::Text(text));
            }

            for tc in choice.delta.tool_calls.into_iter().flatten() {
                let (name, arguments) = tc
                    .function
                    .map(|f| (f.name, f.arguments))
                    .unwrap_or_default();
                events.push(ChunkEvent::ToolCallFragment {
                    slot: tc.index,
                    id: tc.id.filter(|id| !id.is_empty()),
                    name: name.filter(|n| !n.is_empty()),
                    arguments,
                });
            }

            if let Some(reason) = choice.finish_reason {
                events.push(ChunkEvent::Finish(map_finish_reason(&reason)));
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(ChunkEvent::Usage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            });
        }

        events
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

/// Gemini delivers each function call whole, so calls get consecutive slots.
#[derive(Debug, Default)]
pub struct GeminiAdapter {
    next_slot: u64,
}

impl GeminiAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Gemini base URLs need an API version segment; `/v1beta` is assumed when absent.
#[must_use]
pub fn gemini_base(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let versioned = base
        .rsplit('/')
        .next()
        .is_some_and(|segment| segment.starts_with("v1"));
    if versioned {
        base.to_string()
    } else {
        format!("{base}/v1beta")
    }
}

impl BackendAdapter for GeminiAdapter {
    type Request = GenerateContentRequest;
    type Response = GenerateContentResponse;
    type Chunk = GenerateContentResponse;

    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn build_request(
        &self,
        req: &MessagesRequest,
        _model: &str,
        max_tokens_cap: u64,
    ) -> Result<GenerateContentRequest> {
        anthropic_to_gemini(req, max_tokens_cap)
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/models/{model}:{method}", gemini_base(base_url))
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("x-goog-api-key", api_key.to_string())
    }

    fn translate_response(&self, resp: &GenerateContentResponse, original_model: &str) -> MessagesResponse {
        gemini_to_anthropic(resp, original_model)
    }

    fn chunk_events(&mut self, chunk: GenerateContentResponse) -> Vec<ChunkEvent> {
        if let Some(err) = chunk.error {
            return vec![ChunkEvent::Error(err.message)];
        }

        let mut events = Vec::new();
        let mut finish = None;

        if let Some(candidate) = chunk.candidates.into_iter().next() {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if part.thought == Some(true) {
                    continue;
                }
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ChunkEvent::Text(text));
                }
                if let Some(call) = part.function_call {
                    events.push(ChunkEvent::ToolCallFragment {
                        slot: Some(self.next_slot),
                        id: call.id,
                        name: Some(call.name),
                        arguments: Some(function_args(&call.args).to_string()),
                    });
                    self.next_slot += 1;
                }
            }
            finish = candidate.finish_reason;
        }

        if let Some(usage) = chunk.usage_metadata {
            events.push(ChunkEvent::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        if let Some(reason) = finish {
            let stop = if self.next_slot > 0 {
                StopReason::ToolUse
            } else {
                map_gemini_finish_reason(&reason)
            };
            events.push(ChunkEvent::Finish(stop));
        }

        events
    }
}
