use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::{LogEntry, RequestSummary, SharedLogger};
use crate::providers::Provider;
use crate::proxy;
use crate::resolve::{resolve_model, ResolvedTarget};
use crate::translate::anthropic_types::{
    CountTokensRequest, CountTokensResponse, ErrorResponse, MessagesRequest,
};
use crate::translate::request::estimate_input_tokens;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/logs", get(handle_logs))
        .route("/", get(handle_root))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        (status, Json(self.to_error_response())).into_response()
    }
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Parse the Anthropic request
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Failed to parse request: {}", e));
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let target = match resolve_model(&req.model, &state.config) {
        Ok(t) => t,
        Err(e) => {
            state.logger.warn("server", format!("Resolution failed: {}", e));
            return e.into_response();
        }
    };

    state.logger.log_request(&RequestSummary {
        original_model: &req.model,
        resolved_model: &target.model,
        provider: target.provider.name(),
        channel: target.channel.as_deref(),
        stream: req.is_streaming(),
        messages: req.messages.len(),
        tools: req.tools.as_ref().map_or(0, Vec::len),
    });

    if target.provider == Provider::Anthropic {
        return handle_passthrough(state, headers, &req, &target).await;
    }

    if req.is_streaming() {
        handle_streaming(state, &req, &target).await
    } else {
        handle_non_streaming(state, &req, &target).await
    }
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    req: &MessagesRequest,
    target: &ResolvedTarget,
) -> Response {
    match proxy::proxy_non_streaming(req, target, &state.config, &state.client, &state.logger).await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            state.logger.error("server", format!("Proxy error: {}", e));
            e.into_response()
        }
    }
}

async fn handle_streaming(
    state: Arc<AppState>,
    req: &MessagesRequest,
    target: &ResolvedTarget,
) -> Response {
    let sse_stream =
        match proxy::proxy_streaming(req, target, &state.config, &state.client, &state.logger)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                state
                    .logger
                    .error("server", format!("Streaming setup error: {}", e));
                return e.into_response();
            }
        };

    let event_stream = sse_stream.map(|result| -> std::result::Result<Event, Infallible> {
        match result {
            Ok(sse_event) => Ok(Event::default()
                .event(sse_event.event)
                .data(sse_event.data)),
            Err(_) => Ok(Event::default().event("error").data("{}")),
        }
    });

    Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_passthrough(
    state: Arc<AppState>,
    headers: HeaderMap,
    req: &MessagesRequest,
    target: &ResolvedTarget,
) -> Response {
    let response =
        match proxy::proxy_passthrough(req, target, &headers, &state.client, &state.logger).await {
            Ok(r) => r,
            Err(e) => {
                state.logger.error("server", format!("Passthrough error: {}", e));
                return e.into_response();
            }
        };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/json"));

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_count_tokens(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let model = req.model.clone();
    let input_tokens = estimate_input_tokens(&MessagesRequest::from(req));
    state.logger.debug(
        "server",
        format!("count_tokens model={} estimate={}", model, input_tokens),
    );

    Json(CountTokensResponse { input_tokens }).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    limit: usize,
}

fn default_logs_limit() -> usize {
    100
}

/// Most recent log entries, newest first.
async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    Json(state.logger.recent(query.limit))
}

async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Anthropic Messages API bridge for OpenAI and Gemini backends",
        "preferred_provider": state.config.routing.preferred_provider,
        "channels": state.config.channels.keys().collect::<Vec<_>>(),
    }))
}
