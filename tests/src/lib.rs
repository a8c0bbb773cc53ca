//! Shared fixtures for the Parley integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::http::{HttpBackend, HttpFault, HttpRequest, HttpResponse};
use parley_core::{
    ApiClient, ConfiguredKeys, HttpChatBackend, LlmProviderKind, SessionStore, TranscriptStore,
    TransportSettings,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const BASE_URL: &str = "http://chat.test/api";

pub fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpFault> + Send + Sync;

/// In-process stand-in for the chat server. Every request is recorded and
/// answered by the handler.
#[derive(Clone)]
pub struct FakeChatServer {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeChatServer {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, HttpFault> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Requests whose path ends with `suffix`.
    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.path().ends_with(suffix))
            .collect()
    }

    pub fn client(&self, retries: u32) -> ApiClient {
        let settings = TransportSettings {
            retries,
            retry_delay: Duration::from_millis(1),
            ..TransportSettings::new(BASE_URL)
        };
        ApiClient::with_defaults(Arc::new(self.clone()), settings)
    }
}

#[async_trait]
impl HttpBackend for FakeChatServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpFault> {
        self.requests.lock().push(request.clone());
        (self.handler)(&request)
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> Result<HttpResponse, HttpFault> {
    Ok(HttpResponse::from_bytes(status, body.to_string()))
}

/// An event-stream body split into one chunk per frame.
pub fn sse_response(payloads: &[&str]) -> Result<HttpResponse, HttpFault> {
    let chunks = payloads
        .iter()
        .map(|payload| Ok(format!("data: {payload}\n\n").into_bytes()))
        .collect();
    Ok(HttpResponse::from_chunks(200, chunks))
}

pub fn request_json(request: &HttpRequest) -> serde_json::Value {
    let body = request.body.as_deref().unwrap_or_default();
    serde_json::from_slice(body).expect("json body")
}

/// Keys with an OpenAI entry and no environment fallback.
pub fn test_keys() -> ConfiguredKeys {
    let keys = ConfiguredKeys::new().with_env_lookup(|_| None);
    keys.upsert(
        LlmProviderKind::OpenAi,
        parley_core::keys::ProviderEntry::with_key("sk-test"),
    );
    keys
}

pub fn http_store(server: &FakeChatServer, data_dir: &Path) -> SessionStore {
    let backend = HttpChatBackend::new(server.client(0));
    SessionStore::new(
        Arc::new(backend),
        Arc::new(test_keys()),
        TranscriptStore::new(data_dir.to_path_buf()),
    )
}
