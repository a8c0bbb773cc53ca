use anyhow::{Context, Result};
use directories::BaseDirs;
use parley_core::LlmProviderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Per-user preferences remembered between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    #[serde(default)]
    pub last_session: Option<Uuid>,
    #[serde(default)]
    pub provider: Option<LlmProviderKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "UserSettings::default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub auto_confirm_tools: bool,
    #[serde(default)]
    pub tool_servers: Vec<String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            last_session: None,
            provider: None,
            model: None,
            stream: UserSettings::default_stream(),
            auto_confirm_tools: false,
            tool_servers: Vec::new(),
        }
    }
}

impl UserSettings {
    fn default_stream() -> bool {
        true
    }
}

pub fn default_settings_path() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.config_dir().join("parley").join("settings.json"),
        None => PathBuf::from(".parley").join("settings.json"),
    }
}

/// Reads settings, writing defaults when the file is missing or unreadable.
pub async fn load_user_settings(path: &Path) -> Result<UserSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                let defaults = UserSettings::default();
                save_user_settings(path, &defaults).await?;
                warn!(
                    error = ?err,
                    "failed to parse settings.json, resetting to defaults"
                );
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let defaults = UserSettings::default();
            save_user_settings(path, &defaults).await?;
            Ok(defaults)
        }
        Err(err) => Err(err).context("failed to read settings.json"),
    }
}

pub async fn save_user_settings(path: &Path, settings: &UserSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write settings.json at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = load_user_settings(&path).await.unwrap();
        assert_eq!(settings, UserSettings::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_resets_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "{ nope").await.unwrap();
        let settings = load_user_settings(&path).await.unwrap();
        assert!(settings.stream);
        assert!(settings.last_session.is_none());
    }

    #[tokio::test]
    async fn saved_settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = UserSettings {
            last_session: Some(Uuid::new_v4()),
            provider: Some(LlmProviderKind::DeepSeek),
            stream: false,
            ..UserSettings::default()
        };
        save_user_settings(&path, &settings).await.unwrap();
        assert_eq!(load_user_settings(&path).await.unwrap(), settings);
    }
}
