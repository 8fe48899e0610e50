//! Backend providers the proxy can route to.
//!
//! Each provider has a preset with its default base URL and the environment
//! variable its API key is read from. The known-model lists drive provider
//! inference for model ids that arrive without a `provider/` prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(alias = "google")]
    Gemini,
    Anthropic,
}

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub provider: Provider,
    pub base_url: &'static str,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        provider: Provider::OpenAi,
        base_url: "https://api.openai.com/v1",
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        provider: Provider::Gemini,
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        default_api_key_env: "GEMINI_API_KEY",
    },
    ProviderPreset {
        provider: Provider::Anthropic,
        base_url: "https://api.anthropic.com",
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
];

/// Model ids routed to OpenAI when they arrive without a prefix.
pub const OPENAI_MODELS: &[&str] = &[
    "o3-mini",
    "o1",
    "o1-mini",
    "o1-pro",
    "o3",
    "o4-mini",
    "gpt-4.5-preview",
    "gpt-4o",
    "gpt-4o-audio-preview",
    "chatgpt-4o-latest",
    "gpt-4o-mini",
    "gpt-4o-mini-audio-preview",
    "gpt-4.1",
    "gpt-4.1-mini",
    "gpt-4.1-nano",
];

/// Model ids routed to Gemini when they arrive without a prefix.
pub const GEMINI_MODELS: &[&str] = &[
    "gemini-2.5-pro-preview-03-25",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.0-flash",
];

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Gemini, Provider::Anthropic];

    /// Parse a provider name; `google` is accepted for Gemini.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Provider> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "gemini" | "google" => Some(Provider::Gemini),
            "anthropic" => Some(Provider::Anthropic),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Model id prefix, e.g. `openai/`.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai/",
            Provider::Gemini => "gemini/",
            Provider::Anthropic => "anthropic/",
        }
    }

    /// Split a recognized provider prefix off a model id.
    #[must_use]
    pub fn split_prefix(model: &str) -> Option<(Provider, &str)> {
        Self::ALL
            .iter()
            .find_map(|p| model.strip_prefix(p.prefix()).map(|rest| (*p, rest)))
    }

    #[must_use]
    pub fn preset(self) -> &'static ProviderPreset {
        PRESETS
            .iter()
            .find(|p| p.provider == self)
            .unwrap_or(&PRESETS[0])
    }

    /// Provider whose known-model list contains `model`, if exactly one does.
    #[must_use]
    pub fn infer_from_model(model: &str) -> Option<Provider> {
        let openai = OPENAI_MODELS.contains(&model);
        let gemini = GEMINI_MODELS.contains(&model);
        match (openai, gemini) {
            (true, false) => Some(Provider::OpenAi),
            (false, true) => Some(Provider::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers() {
        assert_eq!(Provider::from_name("openai"), Some(Provider::OpenAi));
        assert_eq!(Provider::from_name("Gemini"), Some(Provider::Gemini)); // case-insensitive
        assert_eq!(Provider::from_name("google"), Some(Provider::Gemini));
        assert_eq!(Provider::from_name("fireworks"), None);
    }

    #[test]
    fn test_split_prefix() {
        assert_eq!(
            Provider::split_prefix("gemini/gemini-2.5-pro"),
            Some((Provider::Gemini, "gemini-2.5-pro"))
        );
        assert_eq!(Provider::split_prefix("gpt-4o"), None);
    }

    #[test]
    fn test_infer_from_model_lists() {
        assert_eq!(Provider::infer_from_model("gpt-4o-mini"), Some(Provider::OpenAi));
        assert_eq!(Provider::infer_from_model("gemini-2.0-flash"), Some(Provider::Gemini));
        assert_eq!(Provider::infer_from_model("llama-3-70b"), None);
    }

    #[test]
    fn test_every_provider_has_a_preset() {
        for provider in Provider::ALL {
            assert_eq!(provider.preset().provider, provider);
        }
    }

    #[test]
    fn test_serde_names() {
        let p: Provider = serde_json::from_str("\"google\"").unwrap();
        assert_eq!(p, Provider::Gemini);
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
    }
}
