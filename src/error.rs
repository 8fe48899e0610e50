//! Error types for the proxy.

use crate::translate::anthropic_types::ErrorResponse;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// No usable backend target (missing credentials, unknown provider).
    #[error("Resolution error: {message}")]
    Resolution { message: String },

    /// The inbound request cannot be expressed in the backend's format.
    #[error("Translation error: {message}")]
    Translation { message: String },

    /// Network failure, non-2xx status or an error reported by the backend.
    #[error("Backend error: {message}")]
    Backend {
        status: Option<u16>,
        message: String,
    },

    #[error("Malformed arguments for tool '{tool}': {message}")]
    MalformedToolArguments { tool: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn backend(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Backend {
            status,
            message: msg.into(),
        }
    }

    pub fn malformed_tool_arguments(tool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedToolArguments {
            tool: tool.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// HTTP status the server answers with when this error aborts a request.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Resolution { .. } => 401,
            Self::Translation { .. } | Self::Json(_) => 400,
            Self::Backend { status, .. } => status.filter(|s| *s >= 400).unwrap_or(502),
            Self::Http(e) if e.is_timeout() => 504,
            Self::Http(_) => 502,
            _ => 500,
        }
    }

    /// Anthropic-shaped error body for this error.
    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Self::Resolution { message } => ErrorResponse::authentication(message.clone()),
            Self::Translation { message } => ErrorResponse::invalid_request(message.clone()),
            Self::Json(e) => ErrorResponse::invalid_request(e.to_string()),
            Self::Backend { status, message } => match status {
                Some(429) => ErrorResponse::rate_limited(message.clone()),
                Some(503 | 529) => ErrorResponse::overloaded(message.clone()),
                _ => ErrorResponse::api_error(message.clone()),
            },
            other => ErrorResponse::api_error(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_maps_to_authentication_error() {
        let err = ProxyError::resolution("no api key for provider 'gemini'");
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.to_error_response().error.error_type, "authentication_error");
    }

    #[test]
    fn test_backend_status_passes_through() {
        let err = ProxyError::backend(Some(429), "slow down");
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_error_response().error.error_type, "rate_limit_error");

        let err = ProxyError::backend(None, "connection reset");
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.to_error_response().error.error_type, "api_error");
    }

    #[test]
    fn test_translation_is_bad_request() {
        let err = ProxyError::translation("tool_choice names undeclared tool 'x'");
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err.to_error_response().error.error_type,
            "invalid_request_error"
        );
    }
}
