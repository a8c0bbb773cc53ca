use crate::api::{ChatRequest, ChatResponse, RunToolRequest, RunToolResponse};
use crate::error::ApiClientError;
use crate::session::{MessageRole, Session, ToolCall};
use crate::sse::{self, ChatStreamChunk, StreamEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAi,
    DeepSeek,
    OpenRouter,
    Mock,
}

impl LlmProviderKind {
    pub const ALL: [LlmProviderKind; 4] = [
        LlmProviderKind::OpenAi,
        LlmProviderKind::DeepSeek,
        LlmProviderKind::OpenRouter,
        LlmProviderKind::Mock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::OpenRouter => "openrouter",
            Self::Mock => "mock",
        }
    }

    /// Model used when neither the caller nor the config names one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::DeepSeek => "deepseek-chat",
            Self::OpenRouter => "openai/gpt-4o-mini",
            Self::Mock => "mock",
        }
    }

    pub fn from_environment() -> Self {
        std::env::var("PARLEY_PROVIDER")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(Self::OpenAi)
    }
}

impl fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for LlmProviderKind {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownProvider(value.to_string()))
    }
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ApiClientError>>;

/// Everything the session engine needs from the outside world: completions,
/// tool execution and title generation.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse, ApiClientError>;

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ApiClientError>;

    async fn run_tool(&self, request: &RunToolRequest) -> Result<RunToolResponse, ApiClientError>;

    async fn generate_title(&self, session_id: Uuid) -> Result<String, ApiClientError>;

    /// Pushes a local copy of the session to the server-held history.
    async fn sync_session(&self, _session: &Session) -> Result<(), ApiClientError> {
        Ok(())
    }
}

/// Canned behaviour for the next chat turn of a [`MockBackend`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    ToolCalls {
        reply: String,
        tool_calls: Vec<ToolCall>,
    },
    Fail(ApiClientError),
    /// Streams `partial` and then emits an error frame.
    BrokenStream { partial: String, error: String },
}

impl MockReply {
    pub fn text(reply: impl Into<String>) -> Self {
        Self::Text(reply.into())
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::ToolCalls {
            reply: String::new(),
            tool_calls,
        }
    }
}

/// Offline backend. Replays scripted replies and falls back to a synthetic
/// echo when the script is empty.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    latency: Mutex<Duration>,
    replies: Mutex<VecDeque<MockReply>>,
    tool_results: Mutex<VecDeque<Result<RunToolResponse, ApiClientError>>>,
    titles: Mutex<VecDeque<Result<String, ApiClientError>>>,
    chat_requests: Mutex<Vec<ChatRequest>>,
    tool_requests: Mutex<Vec<RunToolRequest>>,
    synced: Mutex<Vec<Uuid>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.inner.replies.lock().push_back(reply);
    }

    pub fn push_tool_result(&self, result: Result<RunToolResponse, ApiClientError>) {
        self.inner.tool_results.lock().push_back(result);
    }

    pub fn push_title(&self, title: Result<String, ApiClientError>) {
        self.inner.titles.lock().push_back(title);
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.inner.chat_requests.lock().clone()
    }

    pub fn tool_requests(&self) -> Vec<RunToolRequest> {
        self.inner.tool_requests.lock().clone()
    }

    pub fn synced_sessions(&self) -> Vec<Uuid> {
        self.inner.synced.lock().clone()
    }

    async fn next_reply(&self, request: &ChatRequest) -> MockReply {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.inner.chat_requests.lock().push(request.clone());
        let scripted = self.inner.replies.lock().pop_front();
        scripted.unwrap_or_else(|| MockReply::Text(synthetic_reply(request)))
    }
}

fn synthetic_reply(request: &ChatRequest) -> String {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|msg| msg.role == MessageRole::User)
        .map(|msg| msg.content.clone())
        .unwrap_or_else(|| "How can I help you today?".to_string());
    format!(
        "[{}] Model {:?}: received '{}'.",
        request.provider, request.model, prompt
    )
}

/// Splits a reply into word-sized fragments, tool calls riding on the last.
fn fragments(reply: &str, tool_calls: Vec<ToolCall>, session_id: Uuid) -> Vec<ChatStreamChunk> {
    let mut chunks: Vec<ChatStreamChunk> = reply
        .split_inclusive(' ')
        .map(|word| ChatStreamChunk {
            session_id: Some(session_id),
            ..ChatStreamChunk::text(word)
        })
        .collect();
    if !tool_calls.is_empty() {
        match chunks.last_mut() {
            Some(last) => last.tool_calls = Some(tool_calls),
            None => chunks.push(ChatStreamChunk {
                tool_calls: Some(tool_calls),
                session_id: Some(session_id),
                is_streaming: true,
                ..ChatStreamChunk::default()
            }),
        }
    }
    chunks
}

/// Frames are re-cut into small reads so consumers see partial frames.
const MOCK_READ_SIZE: usize = 7;

#[async_trait]
impl ChatBackend for MockBackend {
    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse, ApiClientError> {
        let response = match self.next_reply(request).await {
            MockReply::Text(reply) => ChatResponse::reply(reply, request.session_id),
            MockReply::ToolCalls { reply, tool_calls } => {
                let mut response = ChatResponse::reply(reply, request.session_id);
                response.tool_calls = Some(tool_calls);
                response
            }
            MockReply::Fail(err) => return Err(err),
            MockReply::BrokenStream { error, .. } => return Err(ApiClientError::api(error, None)),
        };
        Ok(response)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream, ApiClientError> {
        let session_id = request.session_id;
        let produced: Vec<Result<ChatStreamChunk, String>> = match self.next_reply(request).await {
            MockReply::Text(reply) => fragments(&reply, Vec::new(), session_id)
                .into_iter()
                .map(Ok)
                .collect(),
            MockReply::ToolCalls { reply, tool_calls } => fragments(&reply, tool_calls, session_id)
                .into_iter()
                .map(Ok)
                .collect(),
            MockReply::Fail(err) => return Err(err),
            MockReply::BrokenStream { partial, error } => fragments(&partial, Vec::new(), session_id)
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(error)))
                .collect(),
        };

        let frames: Vec<String> = sse::event_stream(stream::iter(produced), Some(session_id))
            .collect()
            .await;
        let wire = frames.concat().into_bytes();
        let reads: Vec<Result<Vec<u8>, String>> = wire
            .chunks(MOCK_READ_SIZE)
            .map(|piece| Ok(piece.to_vec()))
            .collect();

        Ok(sse::decode_stream(stream::iter(reads))
            .map(|event| event.map_err(ApiClientError::from))
            .boxed())
    }

    async fn run_tool(&self, request: &RunToolRequest) -> Result<RunToolResponse, ApiClientError> {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.inner.tool_requests.lock().push(request.clone());
        let scripted = self.inner.tool_results.lock().pop_front();
        scripted.unwrap_or_else(|| {
            let name = request.tool_call.name();
            Ok(RunToolResponse {
                result: format!("Mock result for tool: {name}"),
                reply: Some(format!("I've executed the {name} tool.")),
                error: None,
            })
        })
    }

    async fn generate_title(&self, _session_id: Uuid) -> Result<String, ApiClientError> {
        let scripted = self.inner.titles.lock().pop_front();
        scripted.unwrap_or_else(|| Ok("Mock conversation".to_string()))
    }

    async fn sync_session(&self, session: &Session) -> Result<(), ApiClientError> {
        self.inner.synced.lock().push(session.id);
        Ok(())
    }
}
