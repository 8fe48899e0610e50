//! Backend invocation: sends translated requests to the resolved backend and
//! turns its reply into an Anthropic response or an Anthropic SSE event stream.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::providers::Provider;
use crate::resolve::ResolvedTarget;
use crate::translate::adapter::{BackendAdapter, GeminiAdapter, OpenAiAdapter};
use crate::translate::cfp::CfpAdapter;
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::openai_types::ChatErrorResponse;
use crate::translate::streaming::StreamTranslator;

use eventsource_stream::Eventsource;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::time::Duration;

/// Outcome of proxying a streaming request
pub type SseStream = Pin<Box<dyn Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_stream_event(event: &StreamEvent) -> Option<Self> {
        serde_json::to_string(event).ok().map(|data| Self {
            event: event.event_name().to_string(),
            data,
        })
    }
}

/// Forward a non-streaming Anthropic request to a translated backend.
pub async fn proxy_non_streaming(
    req: &MessagesRequest,
    target: &ResolvedTarget,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<MessagesResponse> {
    match (target.provider, target.text_tools) {
        (Provider::OpenAi, false) => invoke(OpenAiAdapter, req, target, config, client, logger).await,
        (Provider::OpenAi, true) => {
            invoke(CfpAdapter::new(OpenAiAdapter), req, target, config, client, logger).await
        }
        (Provider::Gemini, false) => {
            invoke(GeminiAdapter::new(), req, target, config, client, logger).await
        }
        (Provider::Gemini, true) => {
            let adapter = CfpAdapter::new(GeminiAdapter::new());
            invoke(adapter, req, target, config, client, logger).await
        }
        (Provider::Anthropic, _) => Err(not_translated(target)),
    }
}

/// Forward a streaming Anthropic request, returning a stream of Anthropic SSE events.
pub async fn proxy_streaming(
    req: &MessagesRequest,
    target: &ResolvedTarget,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<SseStream> {
    match (target.provider, target.text_tools) {
        (Provider::OpenAi, false) => {
            invoke_streaming(OpenAiAdapter, req, target, config, client, logger).await
        }
        (Provider::OpenAi, true) => {
            let adapter = CfpAdapter::new(OpenAiAdapter);
            invoke_streaming(adapter, req, target, config, client, logger).await
        }
        (Provider::Gemini, false) => {
            invoke_streaming(GeminiAdapter::new(), req, target, config, client, logger).await
        }
        (Provider::Gemini, true) => {
            let adapter = CfpAdapter::new(GeminiAdapter::new());
            invoke_streaming(adapter, req, target, config, client, logger).await
        }
        (Provider::Anthropic, _) => Err(not_translated(target)),
    }
}

fn not_translated(target: &ResolvedTarget) -> ProxyError {
    ProxyError::config(format!(
        "model '{}' is served by passthrough, not translation",
        target.model
    ))
}

async fn invoke<A: BackendAdapter>(
    adapter: A,
    req: &MessagesRequest,
    target: &ResolvedTarget,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<MessagesResponse> {
    let response = send(&adapter, req, target, config, client, logger, false).await?;
    let body = response.text().await?;

    let backend_resp: A::Response = serde_json::from_str(&body).map_err(|e| {
        ProxyError::backend(
            None,
            format!(
                "Failed to parse provider response: {}. Body: {}",
                e,
                truncate(&body, 300)
            ),
        )
    })?;

    let anthropic_resp = adapter.translate_response(&backend_resp, &req.model);

    logger.info(
        "proxy",
        format!(
            "Completed: in={} out={} tokens",
            anthropic_resp.usage.input_tokens, anthropic_resp.usage.output_tokens
        ),
    );

    Ok(anthropic_resp)
}

async fn invoke_streaming<A: BackendAdapter + 'static>(
    adapter: A,
    req: &MessagesRequest,
    target: &ResolvedTarget,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<SseStream> {
    let response = send(&adapter, req, target, config, client, logger, true).await?;

    let data = sse_data(response);
    let translator = StreamTranslator::new(&req.model);
    let idle_timeout = Duration::from_secs(config.params.stream_idle_timeout_secs);

    Ok(Box::pin(translate_stream(
        data,
        adapter,
        translator,
        idle_timeout,
        logger.clone(),
    )))
}

/// POST the translated request; non-2xx statuses become [`ProxyError::Backend`].
async fn send<A: BackendAdapter>(
    adapter: &A,
    req: &MessagesRequest,
    target: &ResolvedTarget,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
    stream: bool,
) -> Result<reqwest::Response> {
    let model = target.backend_model();
    let body = adapter.build_request(req, model, config.params.max_tokens_cap)?;
    let url = adapter.endpoint(&target.base_url, model, stream);
    let (auth_name, auth_value) = adapter.auth_header(&target.api_key);

    logger.debug(
        "proxy",
        format!(
            "POST {} provider={} model={}{}",
            url,
            adapter.provider(),
            model,
            if stream { " (streaming)" } else { "" }
        ),
    );

    let response = client
        .post(&url)
        .header(auth_name, auth_value)
        .json(&body)
        .send()
        .await?;

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        logger.warn(
            "proxy",
            format!("Provider error status={}: {}", status, truncate(&body, 300)),
        );
        return Err(backend_error(status, &body));
    }

    Ok(response)
}

/// Error for a non-2xx backend reply, using the backend's own message when it has one.
#[must_use]
pub fn backend_error(status: u16, body: &str) -> ProxyError {
    let message = serde_json::from_str::<ChatErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("Provider returned status {}: {}", status, truncate(body, 500)));
    ProxyError::backend(Some(status), message)
}

/// `data:` payloads of an SSE response body.
fn sse_data(response: reqwest::Response) -> impl Stream<Item = Result<String>> + Send + 'static {
    response.bytes_stream().eventsource().map(|event| {
        event
            .map(|e| e.data)
            .map_err(|e| ProxyError::backend(None, format!("Stream decode error: {e}")))
    })
}

/// Drive a [`StreamTranslator`] from backend SSE payloads.
///
/// Stops pulling on the first decode error, backend error chunk or idle
/// timeout; each of those ends the client stream with the `error` stop reason.
/// Dropping the returned stream drops the backend connection with it.
pub fn translate_stream<A, S>(
    data: S,
    mut adapter: A,
    mut translator: StreamTranslator,
    idle_timeout: Duration,
    logger: SharedLogger,
) -> impl Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send + 'static
where
    A: BackendAdapter + 'static,
    S: Stream<Item = Result<String>> + Send + 'static,
{
    async_stream::stream! {
        let data = tokio_stream::StreamExt::timeout(data, idle_timeout);
        tokio::pin!(data);

        while let Some(item) = data.next().await {
            let events = match item {
                Err(_elapsed) => translator.fail(&format!(
                    "no data from backend for {}s",
                    idle_timeout.as_secs()
                )),
                Ok(Err(e)) => translator.fail(&e.to_string()),
                Ok(Ok(payload)) => {
                    let payload = payload.trim();
                    if payload.is_empty() {
                        continue;
                    }
                    if payload == "[DONE]" {
                        break;
                    }
                    match serde_json::from_str::<A::Chunk>(payload) {
                        Ok(chunk) => translator.process_events(adapter.chunk_events(chunk)),
                        Err(e) => {
                            logger.debug("stream", format!("Skipping unparseable chunk: {}", e));
                            continue;
                        }
                    }
                }
            };

            for event in &events {
                if let Some(sse) = SseEvent::from_stream_event(event) {
                    yield Ok(sse);
                }
            }

            if translator.is_finished() {
                break;
            }
        }

        let held_back = adapter.flush();
        if !held_back.is_empty() {
            for event in &translator.process_events(held_back) {
                if let Some(sse) = SseEvent::from_stream_event(event) {
                    yield Ok(sse);
                }
            }
        }

        // Ensure stream is properly closed even if [DONE] was missing
        for event in &translator.finish() {
            if let Some(sse) = SseEvent::from_stream_event(event) {
                yield Ok(sse);
            }
        }

        logger.info("stream", format!("Stream completed: {}", translator.message_id()));
    }
}

/// Forward an Anthropic-format request unchanged (apart from the model id)
/// to an Anthropic backend. The response is handed back as-is for streaming
/// through to the client.
pub async fn proxy_passthrough(
    req: &MessagesRequest,
    target: &ResolvedTarget,
    headers: &reqwest::header::HeaderMap,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<reqwest::Response> {
    let url = format!("{}/v1/messages", target.base_url.trim_end_matches('/'));

    let mut forwarded = req.clone();
    forwarded.model = target.backend_model().to_string();

    logger.info("proxy", format!("Passthrough POST {} model={}", url, forwarded.model));

    let version = headers
        .get("anthropic-version")
        .cloned()
        .unwrap_or_else(|| reqwest::header::HeaderValue::from_static("2023-06-01"));

    let mut req_builder = client
        .post(&url)
        .header("x-api-key", &target.api_key)
        .header("anthropic-version", version);

    if let Some(beta) = headers.get("anthropic-beta") {
        req_builder = req_builder.header("anthropic-beta", beta);
    }

    let response = req_builder.json(&forwarded).send().await?;

    logger.info(
        "proxy",
        format!("Passthrough response: status={}", response.status().as_u16()),
    );

    Ok(response)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
