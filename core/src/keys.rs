use crate::llm::LlmProviderKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Credentials handed to the chat request for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No API key configured for {0}. Add one in settings or set {env}.", env = env_var_name(*.0))]
    NotConfigured(LlmProviderKind),
    #[error("Provider {0} is disabled")]
    Disabled(LlmProviderKind),
}

/// Resolves the decrypted API key for a provider.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, provider: LlmProviderKind) -> Result<ProviderCredentials, KeyError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderEntry {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "ProviderEntry::enabled_by_default")]
    pub enabled: bool,
}

impl ProviderEntry {
    pub fn with_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: None,
            enabled: true,
        }
    }

    fn enabled_by_default() -> bool {
        true
    }
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            enabled: true,
        }
    }
}

pub fn env_var_name(provider: LlmProviderKind) -> String {
    format!("PARLEY_{}_API_KEY", provider.as_str().to_uppercase())
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// In-memory key table filled from configuration, with
/// `PARLEY_<PROVIDER>_API_KEY` environment variables as a fallback.
#[derive(Clone)]
pub struct ConfiguredKeys {
    entries: Arc<RwLock<HashMap<LlmProviderKind, ProviderEntry>>>,
    env: EnvLookup,
}

impl Default for ConfiguredKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfiguredKeys {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn entry(&self, provider: LlmProviderKind) -> Option<ProviderEntry> {
        self.entries.read().get(&provider).cloned()
    }

    pub fn upsert(&self, provider: LlmProviderKind, entry: ProviderEntry) {
        self.entries.write().insert(provider, entry);
    }

    pub fn set_enabled(&self, provider: LlmProviderKind, enabled: bool) {
        self.entries.write().entry(provider).or_default().enabled = enabled;
    }
}

#[async_trait]
impl KeyResolver for ConfiguredKeys {
    async fn resolve(&self, provider: LlmProviderKind) -> Result<ProviderCredentials, KeyError> {
        let entry = self.entry(provider).unwrap_or_default();
        if !entry.enabled {
            return Err(KeyError::Disabled(provider));
        }
        if provider == LlmProviderKind::Mock {
            return Ok(ProviderCredentials {
                api_key: None,
                base_url: entry.base_url,
            });
        }
        let api_key = entry
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .or_else(|| (self.env)(&env_var_name(provider)))
            .filter(|key| !key.trim().is_empty())
            .ok_or(KeyError::NotConfigured(provider))?;
        Ok(ProviderCredentials {
            api_key: Some(api_key),
            base_url: entry.base_url,
        })
    }
}
