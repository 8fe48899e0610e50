//! Model and channel resolution.
//!
//! Turns a client model string of the form `[<provider>/]<model-id>[:<channel>]`
//! into a concrete backend target. Resolution is a pure function of the
//! string and the loaded [`ProxyConfig`].
//!
//! A model id ending in `-cfp`, `-text` or `-textonly` selects the text tool
//! protocol (see [`crate::translate::cfp`]); the suffix never reaches the
//! backend.

use crate::config::{ChannelConfig, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::providers::Provider;

/// The backend a single request is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub provider: Provider,
    /// Fully prefixed model id, e.g. `openai/gpt-4o-mini`.
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    /// Channel that supplied `base_url`/`api_key`, if any.
    pub channel: Option<String>,
    /// Tools are described in the prompt and parsed back out of the reply
    /// text instead of using the backend's native tool calling.
    pub text_tools: bool,
}

impl ResolvedTarget {
    /// Model id as the backend expects it (provider prefix removed).
    #[must_use]
    pub fn backend_model(&self) -> &str {
        self.model
            .strip_prefix(self.provider.prefix())
            .unwrap_or(&self.model)
    }
}

/// Resolve a client-supplied model string against the config.
pub fn resolve_model(requested: &str, config: &ProxyConfig) -> Result<ResolvedTarget> {
    let requested = requested.trim();
    let (model, channel) = split_channel(requested, config);
    let (model, text_tools) = split_text_tools_suffix(model);

    let aliased = apply_alias(model, config);
    let (provider, model) = match Provider::split_prefix(&aliased) {
        Some((provider, _)) => (provider, aliased.clone()),
        None => {
            let provider = Provider::infer_from_model(&aliased)
                .unwrap_or(config.routing.preferred_provider);
            (provider, format!("{}{}", provider.prefix(), aliased))
        }
    };

    let (base_url, api_key) = match &channel {
        Some((_, ch)) => (
            ch.base_url.clone(),
            non_empty(ch.api_key.as_deref())
                .or_else(|| non_empty(config.fallback_api_key.as_deref()))
                .or_else(|| config.provider_api_key(provider))
                .map(str::to_string),
        ),
        None => (
            config.provider_base_url(provider),
            config.provider_api_key(provider).map(str::to_string),
        ),
    };

    let api_key = api_key.ok_or_else(|| {
        ProxyError::resolution(format!(
            "No API key configured for provider '{}' (model '{}'). Set {} or use a channel.",
            provider,
            requested,
            provider.preset().default_api_key_env
        ))
    })?;

    let channel = channel.map(|(name, _)| name);
    tracing::debug!(
        requested = %requested,
        resolved = %model,
        provider = %provider,
        channel = channel.as_deref().unwrap_or("default"),
        text_tools,
        "Model mapping"
    );

    Ok(ResolvedTarget {
        provider,
        model,
        base_url,
        api_key,
        channel,
        text_tools,
    })
}

const TEXT_TOOLS_SUFFIXES: [&str; 3] = ["-textonly", "-cfp", "-text"];

/// Strip a text tool protocol suffix, reporting whether one was present.
fn split_text_tools_suffix(model: &str) -> (&str, bool) {
    TEXT_TOOLS_SUFFIXES
        .iter()
        .find_map(|suffix| model.strip_suffix(suffix))
        .filter(|stripped| !stripped.is_empty())
        .map_or((model, false), |stripped| (stripped, true))
}

fn non_empty(key: Option<&str>) -> Option<&str> {
    key.filter(|k| !k.trim().is_empty())
}

/// Split a trailing `:<channel>` suffix. An unknown channel is dropped and
/// default routing applies.
fn split_channel<'a>(
    requested: &'a str,
    config: &'a ProxyConfig,
) -> (&'a str, Option<(String, &'a ChannelConfig)>) {
    let Some((model, suffix)) = requested.rsplit_once(':') else {
        return (requested, None);
    };
    if suffix.is_empty() {
        return (model, None);
    }

    let name = suffix.to_lowercase();
    match config.channel(&name) {
        Some(channel) => (model, Some((name, channel))),
        None => {
            tracing::warn!(channel = %name, "Channel not found, using default routing");
            (model, None)
        }
    }
}

/// Substitute the configured big/small model for the `sonnet`/`haiku`
/// aliases and for unprefixed Claude family ids.
fn apply_alias(model: &str, config: &ProxyConfig) -> String {
    let lower = model.to_lowercase();
    let claude_family = lower.starts_with("claude-");

    if lower == "haiku" || (claude_family && lower.contains("haiku")) {
        config.routing.small_model.clone()
    } else if lower == "sonnet"
        || (claude_family && (lower.contains("sonnet") || lower.contains("opus")))
    {
        config.routing.big_model.clone()
    } else {
        model.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config
            .apply_env([
                ("PREFERRED_PROVIDER", "openai"),
                ("BIG_MODEL", "gpt-4.1"),
                ("SMALL_MODEL", "gpt-4o-mini"),
                ("OPENAI_API_KEY", "sk-openai"),
                ("GEMINI_API_KEY", "g-key"),
            ])
            .unwrap();
        config
    }

    #[test]
    fn test_haiku_alias_with_openai_preference() {
        let target = resolve_model("haiku", &config()).unwrap();
        assert_eq!(target.provider, Provider::OpenAi);
        assert_eq!(target.model, "openai/gpt-4o-mini");
        assert_eq!(target.backend_model(), "gpt-4o-mini");
        assert_eq!(target.api_key, "sk-openai");
        assert_eq!(target.base_url, "https://api.openai.com/v1");
        assert_eq!(target.channel, None);
        assert!(!target.text_tools);
    }

    #[test]
    fn test_text_tools_suffix_is_stripped() {
        let target = resolve_model("gpt-4o-cfp", &config()).unwrap();
        assert!(target.text_tools);
        assert_eq!(target.model, "openai/gpt-4o");

        let target = resolve_model("gemini-2.0-flash-textonly", &config()).unwrap();
        assert!(target.text_tools);
        assert_eq!(target.provider, Provider::Gemini);
        assert_eq!(target.backend_model(), "gemini-2.0-flash");

        // Suffix sits before the channel.
        let mut config = config();
        config
            .apply_env([
                ("API_KEY", "shared"),
                ("CHANNEL_RELAY_BASE_URL", "https://relay.example.com/v1"),
            ])
            .unwrap();
        let target = resolve_model("haiku-text:relay", &config).unwrap();
        assert!(target.text_tools);
        assert_eq!(target.model, "openai/gpt-4o-mini");
        assert_eq!(target.channel.as_deref(), Some("relay"));

        let target = resolve_model("gpt-4o-context", &config).unwrap();
        assert!(!target.text_tools);
        assert_eq!(target.model, "openai/gpt-4o-context");
    }

    #[test]
    fn test_channel_override() {
        let mut config = config();
        config.channels.insert(
            "gemini2".to_string(),
            ChannelConfig {
                base_url: "https://relay.example.com".to_string(),
                api_key: Some("relay-key".to_string()),
            },
        );

        let target = resolve_model("gemini/gemini-2.5-pro:gemini2", &config).unwrap();
        assert_eq!(target.provider, Provider::Gemini);
        assert_eq!(target.model, "gemini/gemini-2.5-pro");
        assert_eq!(target.base_url, "https://relay.example.com");
        assert_eq!(target.api_key, "relay-key");
        assert_eq!(target.channel.as_deref(), Some("gemini2"));

        // Channel names are case-insensitive.
        let target = resolve_model("gemini/gemini-2.5-pro:GEMINI2", &config).unwrap();
        assert_eq!(target.channel.as_deref(), Some("gemini2"));
    }

    #[test]
    fn test_unknown_channel_falls_back_to_default() {
        let target = resolve_model("gpt-4o:nowhere", &config()).unwrap();
        assert_eq!(target.model, "openai/gpt-4o");
        assert_eq!(target.base_url, "https://api.openai.com/v1");
        assert_eq!(target.channel, None);
    }

    #[test]
    fn test_channel_without_key_uses_fallback() {
        let mut config = config();
        config
            .apply_env([
                ("API_KEY", "shared"),
                ("CHANNEL_RELAY_BASE_URL", "https://relay.example.com/v1"),
            ])
            .unwrap();
        let target = resolve_model("gpt-4o:relay", &config).unwrap();
        assert_eq!(target.api_key, "shared");
        assert_eq!(target.base_url, "https://relay.example.com/v1");
    }

    #[test]
    fn test_provider_inferred_from_model_lists() {
        let target = resolve_model("gemini-2.0-flash", &config()).unwrap();
        assert_eq!(target.provider, Provider::Gemini);
        assert_eq!(target.model, "gemini/gemini-2.0-flash");

        let target = resolve_model("some-local-model", &config()).unwrap();
        assert_eq!(target.provider, Provider::OpenAi);
        assert_eq!(target.model, "openai/some-local-model");
    }

    #[test]
    fn test_claude_family_ids_map_to_aliases() {
        let config = config();
        assert_eq!(
            resolve_model("claude-3-5-haiku-20241022", &config).unwrap().model,
            "openai/gpt-4o-mini"
        );
        assert_eq!(
            resolve_model("claude-sonnet-4-20250514", &config).unwrap().model,
            "openai/gpt-4.1"
        );
    }

    #[test]
    fn test_prefixed_alias_target_kept() {
        let mut config = config();
        config.routing.big_model = "gemini/gemini-2.5-pro".to_string();
        let target = resolve_model("sonnet", &config).unwrap();
        assert_eq!(target.provider, Provider::Gemini);
        assert_eq!(target.model, "gemini/gemini-2.5-pro");
        assert_eq!(target.api_key, "g-key");
    }

    #[test]
    fn test_missing_key_is_resolution_error() {
        let err = resolve_model("anthropic/claude-3-opus", &config()).unwrap_err();
        assert!(matches!(err, ProxyError::Resolution { .. }));
    }

    #[test]
    fn test_resolved_targets_always_carry_a_key() {
        let config = config();
        for model in ["haiku", "sonnet", "gpt-4o", "gemini/x", "anthropic/y", "z:none"] {
            match resolve_model(model, &config) {
                Ok(target) => assert!(!target.api_key.is_empty(), "{model}"),
                Err(e) => assert!(matches!(e, ProxyError::Resolution { .. }), "{model}"),
            }
        }
    }

    #[test]
    fn test_empty_channel_key_falls_through() {
        let mut config: ProxyConfig = toml::from_str(
            r#"
            [channels.relay]
            base_url = "https://relay.example.com/v1"
            api_key = ""
            "#,
        )
        .unwrap();
        config.apply_env([("OPENAI_API_KEY", "sk-openai")]).unwrap();
        let target = resolve_model("gpt-4o:relay", &config).unwrap();
        assert_eq!(target.api_key, "sk-openai");

        config.apply_env([("API_KEY", "shared")]).unwrap();
        let target = resolve_model("gpt-4o:relay", &config).unwrap();
        assert_eq!(target.api_key, "shared");
    }
}
