use parley_core::http::ReqwestBackend;
use parley_core::{
    ApiClient, ChatBackend, ClientConfig, HttpChatBackend, LlmProviderKind, MockBackend,
    SessionStore, TranscriptStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Where the session engine sends its chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Http,
    Offline,
}

impl BackendChoice {
    pub fn resolve(offline: bool, provider: LlmProviderKind) -> Self {
        if offline || provider == LlmProviderKind::Mock {
            Self::Offline
        } else {
            Self::Http
        }
    }
}

pub fn build_backend(config: &ClientConfig, choice: BackendChoice) -> Arc<dyn ChatBackend> {
    match choice {
        BackendChoice::Offline => {
            info!("using offline mock backend");
            Arc::new(MockBackend::new())
        }
        BackendChoice::Http => {
            let client = ApiClient::with_defaults(
                Arc::new(ReqwestBackend::default()),
                config.transport_settings(),
            );
            client.loading().subscribe(|state| {
                debug!(
                    loading = state.is_loading,
                    operation = state.operation.as_deref().unwrap_or(""),
                    "request state"
                );
            });
            info!(base_url = %config.api_base_url, "using chat server");
            Arc::new(HttpChatBackend::new(client))
        }
    }
}

/// Builds the session store, persisting transcripts under `data_dir`
/// (or the configured default).
pub fn build_store(
    config: &ClientConfig,
    choice: BackendChoice,
    data_dir: Option<PathBuf>,
) -> SessionStore {
    let backend = build_backend(config, choice);
    let transcripts = TranscriptStore::new(data_dir.unwrap_or_else(|| config.data_dir()));
    SessionStore::new(backend, Arc::new(config.keys()), transcripts)
        .with_defaults(config.chat_defaults())
}
