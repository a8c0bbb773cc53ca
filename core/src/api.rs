//! Wire types for the chat server and the HTTP-backed [`ChatBackend`].

use crate::error::ApiClientError;
use crate::history::{HistoryPage, HistoryQuery};
use crate::llm::{ChatBackend, EventStream, LlmProviderKind};
use crate::session::{Message, Session, ToolCall};
use crate::sse;
use crate::transport::{ApiClient, InFlight, RequestConfig};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// A tool advertised to the model by one of the enabled tool servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub session_id: Uuid,
    pub provider: LlmProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_tools: Vec<ToolDescriptor>,
}

impl ChatRequest {
    pub fn new(
        session_id: Uuid,
        provider: LlmProviderKind,
        model: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            messages,
            session_id,
            provider,
            model: model.into(),
            api_key: None,
            base_url: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            available_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    pub fn reply(reply: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            reply: Some(reply.into()),
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// A 200 body may still carry an `error`; treat it as a failed call.
    pub fn into_result(self) -> Result<Self, ApiClientError> {
        match self.error {
            Some(error) => Err(ApiClientError::api(error, None)),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunToolRequest {
    pub tool_call: ToolCall,
    pub session_id: Uuid,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunToolResponse {
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunToolResponse {
    pub fn into_result(self) -> Result<Self, ApiClientError> {
        match self.error {
            Some(error) => Err(ApiClientError::api(error, None)),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelToolRequest {
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelToolResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Deserialize)]
struct TitleResponse {
    title: String,
}

/// [`ChatBackend`] that talks to the chat server through an [`ApiClient`].
#[derive(Clone)]
pub struct HttpChatBackend {
    client: ApiClient,
    history_search: Arc<InFlight>,
}

impl HttpChatBackend {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            history_search: Arc::new(InFlight::default()),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Notifies the server that the user declined a tool call.
    pub async fn cancel_tool(
        &self,
        session_id: Uuid,
        tool_call_id: Option<String>,
    ) -> Result<CancelToolResponse, ApiClientError> {
        let body = CancelToolRequest {
            session_id,
            tool_call_id,
        };
        self.client.post("/cancel-tool", &body).await
    }

    /// A newer search aborts any search still in flight.
    pub async fn search_history(&self, query: &HistoryQuery) -> Result<HistoryPage, ApiClientError> {
        query.validate()?;
        let token = self.history_search.begin();
        let mut config = RequestConfig::get("/chat-history").cancel_token(token);
        for (key, value) in query.to_pairs() {
            config = config.query(key, value);
        }
        self.client.send_json(config).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ApiClientError> {
        let path = history_path(session_id)?;
        self.client.get(&path).await
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<Session, ApiClientError> {
        let path = history_path(session_id)?;
        self.client.put(&path, update).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<DeleteResponse, ApiClientError> {
        let path = history_path(session_id)?;
        self.client.delete(&path).await
    }
}

fn history_path(session_id: &str) -> Result<String, ApiClientError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(ApiClientError::validation("Session ID is required"));
    }
    Ok(format!("/chat-history/{session_id}"))
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse, ApiClientError> {
        let config = RequestConfig::post("/chat").json(request)?.timeout(CHAT_TIMEOUT);
        let response: ChatResponse = self.client.send_json(config).await?;
        response.into_result()
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ApiClientError> {
        let config = RequestConfig::post("/chat/stream")
            .json(request)?
            .header("Accept", "text/event-stream")
            .timeout(CHAT_TIMEOUT);
        let response = self.client.open(config).await?;
        debug!(
            session_id = %request.session_id,
            content_type = response.header("content-type").unwrap_or_default(),
            "chat stream opened"
        );
        Ok(sse::decode_stream(response.body)
            .map(|event| event.map_err(ApiClientError::from))
            .boxed())
    }

    async fn run_tool(&self, request: &RunToolRequest) -> Result<RunToolResponse, ApiClientError> {
        let config = RequestConfig::post("/run-tool")
            .json(request)?
            .timeout(TOOL_TIMEOUT);
        let response: RunToolResponse = self.client.send_json(config).await?;
        response.into_result()
    }

    async fn generate_title(&self, session_id: Uuid) -> Result<String, ApiClientError> {
        let path = format!("{}/generate-title", history_path(&session_id.to_string())?);
        let response: TitleResponse = self.client.send_json(RequestConfig::post(path)).await?;
        Ok(response.title)
    }

    async fn sync_session(&self, session: &Session) -> Result<(), ApiClientError> {
        let update = SessionUpdate {
            title: Some(session.title.clone()),
            messages: Some(session.messages.clone()),
        };
        self.update_session(&session.id.to_string(), &update)
            .await
            .map(|_| ())
    }
}
