use crate::api::ToolDescriptor;
use crate::keys::{ConfiguredKeys, ProviderEntry};
use crate::llm::LlmProviderKind;
use crate::state::ChatDefaults;
use crate::transport::{TransportSettings, DEFAULT_TIMEOUT, MAX_RETRIES, RETRY_DELAY};
use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub provider: LlmProviderKind,
    pub model: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub sync_history: bool,
    pub data_dir: Option<PathBuf>,
    pub providers: HashMap<LlmProviderKind, ProviderEntry>,
    /// Tools offered to sessions that enable the tool's server.
    pub tools: Vec<ToolDescriptor>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let provider = LlmProviderKind::OpenAi;
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            provider,
            model: provider.default_model().to_string(),
            timeout: DEFAULT_TIMEOUT,
            retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            sync_history: false,
            data_dir: None,
            providers: HashMap::new(),
            tools: Vec::new(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Parley not configured; create parley.yaml with a server address and provider.")]
    Missing,
    #[error("Parley configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Parley not configured. Create parley.yaml with a server address and provider."
                    .to_string()
            }
            Self::Invalid(detail) => format!("Parley not configured: {detail}. Update parley.yaml."),
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = locate_config_file().ok_or(ConfigError::Missing)?;
        Self::from_path(&path)
    }

    /// Like [`load`](Self::load) but falls back to defaults when no file exists.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::load() {
            Err(ConfigError::Missing) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ParleyConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid parley.yaml: {err}")))?;
        let app = config
            .app
            .ok_or_else(|| ConfigError::Invalid("missing `app` section".to_string()))?;
        resolve_app_settings(app)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            base_url: self.api_base_url.clone(),
            timeout: self.timeout,
            retries: self.retries,
            retry_delay: self.retry_delay,
        }
    }

    pub fn chat_defaults(&self) -> ChatDefaults {
        ChatDefaults {
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            available_tools: self.tools.clone(),
            sync_history: self.sync_history,
        }
    }

    pub fn keys(&self) -> ConfiguredKeys {
        let keys = ConfiguredKeys::new();
        for (provider, entry) in &self.providers {
            keys.upsert(*provider, entry.clone());
        }
        keys
    }

    /// Where transcripts live: the configured directory, else the platform
    /// data directory, else `./.parley`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        ProjectDirs::from("dev", "parley", "parley")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }
}

fn resolve_app_settings(app: AppSection) -> Result<ClientConfig, ConfigError> {
    let defaults = ClientConfig::default();

    let api_base_url = app
        .api_base_url
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .unwrap_or(defaults.api_base_url);
    Url::parse(&api_base_url)
        .map_err(|err| ConfigError::Invalid(format!("api_base_url '{api_base_url}' ({err})")))?;

    let provider = app.provider.unwrap_or(defaults.provider);
    let model = app
        .model
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| provider.default_model().to_string());

    if let Some(temperature) = app.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {temperature} is outside 0.0..=2.0"
            )));
        }
    }
    if app.timeout_secs == Some(0) {
        return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
    }

    let providers: HashMap<LlmProviderKind, ProviderEntry> = [
        (LlmProviderKind::OpenAi, app.openai),
        (LlmProviderKind::DeepSeek, app.deepseek),
        (LlmProviderKind::OpenRouter, app.openrouter),
    ]
    .into_iter()
    .filter_map(|(kind, section)| section.map(|section| (kind, section)))
    .collect();

    if providers.get(&provider).is_some_and(|entry| !entry.enabled) {
        return Err(ConfigError::Invalid(format!(
            "default provider {provider} is disabled"
        )));
    }

    let tools = app.tools.unwrap_or_default();
    if let Some(tool) = tools
        .iter()
        .find(|tool| tool.name.trim().is_empty() || tool.server_id.trim().is_empty())
    {
        return Err(ConfigError::Invalid(format!(
            "tool '{}' needs both a name and a serverId",
            tool.name
        )));
    }

    Ok(ClientConfig {
        api_base_url,
        provider,
        model,
        timeout: app
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        retries: app.retries.unwrap_or(defaults.retries),
        retry_delay: app
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay),
        system_prompt: app
            .system_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty()),
        temperature: app.temperature,
        max_tokens: app.max_tokens,
        sync_history: app.sync_history.unwrap_or(false),
        data_dir: app.data_dir,
        providers,
        tools,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    parley_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn parley_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("parley.yaml")];
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parley");
        paths.push(config_dir.join("parley.yaml"));
        paths.push(config_dir.join("parley.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".parley").join("parley.yaml"));
        paths.push(home_dir.join(".parley").join("parley.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct ParleyConfig {
    app: Option<AppSection>,
}

#[derive(Debug, Default, Deserialize)]
struct AppSection {
    api_base_url: Option<String>,
    provider: Option<LlmProviderKind>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    sync_history: Option<bool>,
    data_dir: Option<PathBuf>,
    openai: Option<ProviderEntry>,
    deepseek: Option<ProviderEntry>,
    openrouter: Option<ProviderEntry>,
    tools: Option<Vec<ToolDescriptor>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_full_app_section() {
        let yaml = r#"
app:
  api_base_url: https://chat.example.com/api/
  provider: deepseek
  timeout_secs: 45
  retries: 1
  retry_delay_ms: 250
  temperature: 0.3
  sync_history: true
  deepseek:
    api_key: ds-key
    base_url: https://api.deepseek.com
"#;
        let config = ClientConfig::from_yaml_str(yaml).expect("config");
        assert_eq!(config.api_base_url, "https://chat.example.com/api");
        assert_eq!(config.provider, LlmProviderKind::DeepSeek);
        assert_eq!(config.model, "deepseek-chat");
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert!(config.sync_history);
        let deepseek = &config.providers[&LlmProviderKind::DeepSeek];
        assert_eq!(deepseek.api_key.as_deref(), Some("ds-key"));
        assert!(deepseek.enabled);

        let settings = config.transport_settings();
        assert_eq!(settings.retries, 1);
    }

    #[test]
    fn defaults_fill_an_empty_section() {
        let config = ClientConfig::from_yaml_str("app: {}").expect("config");
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.retries, MAX_RETRIES);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn missing_app_section_is_invalid() {
        let err = ClientConfig::from_yaml_str("other: 1").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.user_message().contains("app"));
    }

    #[test]
    fn rejects_bad_urls_and_temperatures() {
        let err = ClientConfig::from_yaml_str("app:\n  api_base_url: not a url").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ClientConfig::from_yaml_str("app:\n  temperature: 3.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn disabled_default_provider_is_invalid() {
        let yaml = "app:\n  provider: openai\n  openai:\n    api_key: sk\n    enabled: false\n";
        let err = ClientConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn tool_descriptors_reach_the_chat_defaults() {
        let yaml = r#"
app:
  tools:
    - name: read_file
      description: Read a file from the workspace
      serverId: filesystem
      inputSchema:
        type: object
    - name: search
      serverId: web
"#;
        let config = ClientConfig::from_yaml_str(yaml).expect("config");
        let defaults = config.chat_defaults();
        assert_eq!(defaults.available_tools.len(), 2);
        assert_eq!(defaults.available_tools[0].server_id, "filesystem");
        assert_eq!(defaults.available_tools[0].input_schema["type"], "object");
        assert_eq!(defaults.available_tools[1].description, "");
    }

    #[test]
    fn tools_without_a_server_are_invalid() {
        let yaml = "app:\n  tools:\n    - name: orphan\n      serverId: ' '\n";
        let err = ClientConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[tokio::test]
    async fn provider_sections_feed_the_key_resolver() {
        use crate::keys::KeyResolver;

        let yaml = "app:\n  openrouter:\n    api_key: or-key\n";
        let keys = ClientConfig::from_yaml_str(yaml)
            .unwrap()
            .keys()
            .with_env_lookup(|_| None);
        let credentials = keys.resolve(LlmProviderKind::OpenRouter).await.unwrap();
        assert_eq!(credentials.api_key.as_deref(), Some("or-key"));
    }
}
