use crate::error::{ProxyError, Result};
use crate::providers::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Named channels, keyed by lowercase name.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    /// Key used by channels that configure a base URL but no key of their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_api_key: Option<String>,
    #[serde(default)]
    pub params: ParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_preferred_provider")]
    pub preferred_provider: Provider,
    #[serde(default = "default_big_model")]
    pub big_model: String,
    #[serde(default = "default_small_model")]
    pub small_model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable the key is read from (defaults to the preset's).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    /// Hard ceiling applied to `max_tokens` for translated backends.
    #[serde(default = "default_max_tokens_cap")]
    pub max_tokens_cap: u64,
    /// Seconds without a backend chunk before a stream is abandoned.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    /// Seconds allowed for a whole backend request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_preferred_provider() -> Provider {
    Provider::OpenAi
}

fn default_big_model() -> String {
    "gpt-4.1".to_string()
}

fn default_small_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_max_tokens_cap() -> u64 {
    16384
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    600
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred_provider(),
            big_model: default_big_model(),
            small_model: default_small_model(),
        }
    }
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            max_tokens_cap: default_max_tokens_cap(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            routing: RoutingConfig::default(),
            providers: ProvidersConfig::default(),
            channels: HashMap::new(),
            fallback_api_key: None,
            params: ParamsConfig::default(),
        }
    }
}

impl ProvidersConfig {
    #[must_use]
    pub fn get(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Gemini => &self.gemini,
            Provider::Anthropic => &self.anthropic,
        }
    }

    fn get_mut(&mut self, provider: Provider) -> &mut ProviderConfig {
        match provider {
            Provider::OpenAi => &mut self.openai,
            Provider::Gemini => &mut self.gemini,
            Provider::Anthropic => &mut self.anthropic,
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.normalize();
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults and environment");
        Ok(Self::default())
    }

    /// Overlay environment-style variables onto the loaded config.
    ///
    /// Recognized keys are listed in the README; unknown keys are ignored.
    /// Provider keys are resolved here so that routing stays a pure function
    /// of the config.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();

        if let Some(host) = vars.get("HOST") {
            self.host = host.clone();
        }
        if let Some(port) = vars.get("PORT") {
            self.port = port
                .parse()
                .map_err(|_| ProxyError::config(format!("PORT is not a valid port: '{port}'")))?;
        }
        if let Some(name) = vars.get("PREFERRED_PROVIDER") {
            self.routing.preferred_provider = Provider::from_name(name).ok_or_else(|| {
                ProxyError::config(format!(
                    "Unknown PREFERRED_PROVIDER '{name}'. Known providers: openai, gemini, anthropic"
                ))
            })?;
        }
        if let Some(model) = vars.get("BIG_MODEL") {
            self.routing.big_model = model.clone();
        }
        if let Some(model) = vars.get("SMALL_MODEL") {
            self.routing.small_model = model.clone();
        }
        if let Some(key) = vars.get("API_KEY") {
            self.fallback_api_key = Some(key.clone());
        }

        for provider in Provider::ALL {
            let upper = provider.name().to_uppercase();
            let entry = self.providers.get_mut(provider);
            if let Some(url) = vars.get(&format!("{upper}_BASE_URL")) {
                entry.base_url = Some(url.clone());
            }
            let key_env = entry
                .api_key_env
                .clone()
                .unwrap_or_else(|| provider.preset().default_api_key_env.to_string());
            if let Some(key) = vars.get(&key_env) {
                entry.api_key = Some(key.clone());
            }
        }

        for (key, base_url) in &vars {
            let Some(name) = key
                .strip_prefix("CHANNEL_")
                .and_then(|rest| rest.strip_suffix("_BASE_URL"))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let api_key = vars.get(&format!("CHANNEL_{name}_API_KEY")).cloned();
            tracing::debug!(channel = %name.to_lowercase(), base_url = %base_url, "Loaded channel");
            self.channels.insert(
                name.to_string(),
                ChannelConfig {
                    base_url: base_url.clone(),
                    api_key,
                },
            );
        }

        self.normalize();
        Ok(())
    }

    /// Lowercase channel names so lookups are case-insensitive.
    pub fn normalize(&mut self) {
        self.channels = std::mem::take(&mut self.channels)
            .into_iter()
            .map(|(name, channel)| (name.to_lowercase(), channel))
            .collect();
    }

    /// Case-insensitive channel lookup.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(&name.to_lowercase())
    }

    /// Base URL for a provider (config override or preset default).
    #[must_use]
    pub fn provider_base_url(&self, provider: Provider) -> String {
        self.providers
            .get(provider)
            .base_url
            .clone()
            .unwrap_or_else(|| provider.preset().base_url.to_string())
    }

    /// Configured API key for a provider, if any.
    #[must_use]
    pub fn provider_api_key(&self, provider: Provider) -> Option<&str> {
        self.providers
            .get(provider)
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("anthropic-bridge.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("anthropic-bridge").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(
            home.join(".config")
                .join("anthropic-bridge")
                .join("config.toml"),
        );
        paths.push(home.join(".anthropic-bridge.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
