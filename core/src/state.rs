//! The conversational session engine.
//!
//! [`SessionStore`] owns every session, drives the per-session phase machine
//! (`Idle → Sending → AwaitingToolConfirmation → ExecutingTool → Idle`) and
//! mirrors each mutation into the [`TranscriptStore`]. A failed request leaves
//! the session `Idle` with its `error` field set.

use crate::api::{ChatRequest, ToolDescriptor};
use crate::error::{ApiClientError, SessionError};
use crate::history::{HistoryExport, HistoryPage, HistoryQuery};
use crate::keys::{KeyResolver, ProviderCredentials};
use crate::llm::{ChatBackend, LlmProviderKind};
use crate::observer::{Observers, SubscriptionId};
use crate::session::{Message, MessagePatch, MessageRole, Session, ToolCall};
use crate::sse::StreamEvent;
use crate::store::TranscriptStore;
use crate::tools::{ToolCallCoordinator, ToolOutcome};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TOOL_CANCELLED_MESSAGE: &str = "Tool execution was cancelled by the user.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Sending,
    AwaitingToolConfirmation,
    ExecutingTool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub pending_tool_call: Option<ToolCall>,
    pub queued_tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Sessions changed. `None` means the whole collection or the current
    /// pointer changed.
    Changed { session_id: Option<Uuid> },
    Error { session_id: Uuid, message: String },
}

/// Request settings applied to every chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatDefaults {
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Offered to the model when the tool's server is enabled on the session.
    pub available_tools: Vec<ToolDescriptor>,
    /// Push every mutated session to the server-held history.
    pub sync_history: bool,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<InnerState>>,
    backend: Arc<dyn ChatBackend>,
    keys: Arc<dyn KeyResolver>,
    transcripts: TranscriptStore,
    observers: Arc<Observers<StoreEvent>>,
    defaults: Arc<ChatDefaults>,
}

#[derive(Default)]
struct InnerState {
    sessions: Vec<Session>,
    current: Option<Uuid>,
    runtime: HashMap<Uuid, SessionRuntime>,
}

#[derive(Default)]
struct SessionRuntime {
    phase: SessionPhase,
    error: Option<String>,
    tools: Arc<ToolCallCoordinator>,
    title_requested: bool,
}

impl SessionRuntime {
    fn can_send(&self) -> bool {
        self.phase == SessionPhase::Idle && self.tools.pending().is_none()
    }
}

impl InnerState {
    fn session(&self, id: Uuid) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    fn current_id(&self) -> Result<Uuid, SessionError> {
        self.current.ok_or(SessionError::NoActiveSession)
    }

    /// Session and its runtime, borrowed together.
    fn parts_mut(&mut self, id: Uuid) -> Result<(&mut Session, &mut SessionRuntime), SessionError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or(SessionError::SessionNotFound(id))?;
        Ok((session, self.runtime.entry(id).or_default()))
    }
}

impl SessionStore {
    /// Builds a store seeded from `transcripts`. An unreadable snapshot is
    /// logged and treated as empty.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        keys: Arc<dyn KeyResolver>,
        transcripts: TranscriptStore,
    ) -> Self {
        let mut sessions = transcripts.load_sessions().unwrap_or_else(|err| {
            warn!(%err, path = ?transcripts.snapshot_path(), "failed to load sessions");
            Vec::new()
        });
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Self {
            inner: Arc::new(RwLock::new(InnerState {
                sessions,
                ..InnerState::default()
            })),
            backend,
            keys,
            transcripts,
            observers: Arc::new(Observers::new()),
            defaults: Arc::new(ChatDefaults::default()),
        }
    }

    pub fn with_defaults(mut self, defaults: ChatDefaults) -> Self {
        self.defaults = Arc::new(defaults);
        self
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        let inner = self.inner.read();
        inner.current.and_then(|id| inner.session(id).cloned())
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.current_session()
            .map(|session| session.messages)
            .unwrap_or_default()
    }

    pub fn status(&self, id: Uuid) -> Option<SessionStatus> {
        let inner = self.inner.read();
        inner.session(id)?;
        let status = match inner.runtime.get(&id) {
            Some(runtime) => SessionStatus {
                phase: runtime.phase,
                pending_tool_call: runtime.tools.pending(),
                queued_tool_calls: runtime.tools.queued(),
                error: runtime.error.clone(),
            },
            None => SessionStatus {
                phase: SessionPhase::Idle,
                pending_tool_call: None,
                queued_tool_calls: Vec::new(),
                error: None,
            },
        };
        Some(status)
    }

    /// Tool call awaiting confirmation in the current session.
    pub fn pending_tool_call(&self) -> Option<ToolCall> {
        let inner = self.inner.read();
        let id = inner.current?;
        inner.runtime.get(&id)?.tools.pending()
    }

    pub fn can_send_message(&self) -> bool {
        let inner = self.inner.read();
        match inner.current {
            Some(id) => inner.runtime.get(&id).map_or(true, SessionRuntime::can_send),
            None => false,
        }
    }

    pub fn create_session(
        &self,
        provider: LlmProviderKind,
        model: impl Into<String>,
        tool_servers: Vec<String>,
    ) -> Session {
        let session = Session::new(provider, model, tool_servers);
        {
            let mut inner = self.inner.write();
            inner.sessions.insert(0, session.clone());
            inner.current = Some(session.id);
        }
        info!(session_id = %session.id, %provider, "created session");
        self.after_mutation(&session);
        session
    }

    /// Makes `id` the current session.
    pub fn load_session(&self, id: Uuid) -> Result<Session, SessionError> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner
                .session(id)
                .cloned()
                .ok_or(SessionError::SessionNotFound(id))?;
            inner.current = Some(id);
            session
        };
        self.observers.notify(&StoreEvent::Changed { session_id: None });
        Ok(session)
    }

    pub fn clear_current_session(&self) {
        self.inner.write().current = None;
        self.observers.notify(&StoreEvent::Changed { session_id: None });
    }

    pub fn rename_session(&self, id: Uuid, title: &str) -> Result<Session, SessionError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SessionError::EmptyTitle);
        }
        let snapshot = {
            let mut inner = self.inner.write();
            let (session, _) = inner.parts_mut(id)?;
            session.title = title.to_string();
            session.touch();
            session.clone()
        };
        self.after_mutation(&snapshot);
        Ok(snapshot)
    }

    pub fn delete_session(&self, id: Uuid) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.write();
            let position = inner
                .sessions
                .iter()
                .position(|session| session.id == id)
                .ok_or(SessionError::SessionNotFound(id))?;
            inner.sessions.remove(position);
            inner.runtime.remove(&id);
            if inner.current == Some(id) {
                inner.current = None;
            }
        }
        if let Err(err) = self.transcripts.delete(id) {
            warn!(%err, session_id = %id, "failed to delete persisted session");
        }
        info!(session_id = %id, "deleted session");
        self.observers.notify(&StoreEvent::Changed { session_id: None });
        Ok(())
    }

    pub fn archive_session(&self, id: Uuid) -> Result<(), SessionError> {
        self.delete_session(id)
    }

    /// Appends a message to the current session. A tool message must answer a
    /// tool call emitted earlier in the same session.
    pub fn add_message(&self, message: Message) -> Result<Message, SessionError> {
        let (stored, snapshot) = {
            let mut inner = self.inner.write();
            let id = inner.current_id()?;
            let (session, _) = inner.parts_mut(id)?;
            if let Some(tool_call_id) = message.tool_call_id.as_deref() {
                if message.role == MessageRole::Tool && !session.knows_tool_call(tool_call_id) {
                    return Err(SessionError::UnknownToolCall(tool_call_id.to_string()));
                }
            }
            session.push_message(message);
            (last_message(session)?, session.clone())
        };
        self.after_mutation(&snapshot);
        Ok(stored)
    }

    pub fn update_message(&self, id: Uuid, patch: MessagePatch) -> Result<Message, SessionError> {
        let (updated, snapshot) = {
            let mut inner = self.inner.write();
            let session_id = inner.current_id()?;
            let (session, _) = inner.parts_mut(session_id)?;
            let message = session
                .messages
                .iter_mut()
                .find(|message| message.id == id)
                .ok_or(SessionError::MessageNotFound(id))?;
            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(tool_calls) = patch.tool_calls {
                message.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
            }
            let updated = message.clone();
            session.touch();
            (updated, session.clone())
        };
        self.after_mutation(&snapshot);
        Ok(updated)
    }

    pub fn delete_message(&self, id: Uuid) -> Result<(), SessionError> {
        let snapshot = {
            let mut inner = self.inner.write();
            let session_id = inner.current_id()?;
            let (session, _) = inner.parts_mut(session_id)?;
            let position = session
                .messages
                .iter()
                .position(|message| message.id == id)
                .ok_or(SessionError::MessageNotFound(id))?;
            session.messages.remove(position);
            session.touch();
            session.clone()
        };
        self.after_mutation(&snapshot);
        Ok(())
    }

    /// Sends `content` as a user message and waits for the batched reply.
    /// Returns the assistant message that was appended.
    pub async fn send_message(&self, content: &str) -> Result<Message, SessionError> {
        let session = self.begin_turn(content)?;
        let request = match self.chat_request(&session).await {
            Ok(request) => request,
            Err(err) => return Err(self.fail_turn(session.id, err)),
        };
        match self.backend.send_chat(&request).await {
            Ok(response) => {
                let tool_calls = response.tool_calls().to_vec();
                self.complete_turn(session.id, response.reply.unwrap_or_default(), tool_calls)
            }
            Err(err) => Err(self.fail_turn(session.id, err.into())),
        }
    }

    /// Streaming variant of [`send_message`](Self::send_message).
    /// `on_delta` sees every reply fragment as it arrives.
    pub async fn send_message_streaming<F>(
        &self,
        content: &str,
        mut on_delta: F,
    ) -> Result<Message, SessionError>
    where
        F: FnMut(&str) + Send,
    {
        let session = self.begin_turn(content)?;
        let request = match self.chat_request(&session).await {
            Ok(request) => request,
            Err(err) => return Err(self.fail_turn(session.id, err)),
        };
        let mut events = match self.backend.stream_chat(&request).await {
            Ok(events) => events,
            Err(err) => return Err(self.fail_turn(session.id, err.into())),
        };

        let mut reply = String::new();
        let mut tool_calls = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::Chunk(chunk)) => {
                    if let Some(delta) = chunk.reply.filter(|delta| !delta.is_empty()) {
                        on_delta(&delta);
                        reply.push_str(&delta);
                    }
                    tool_calls.extend(chunk.tool_calls.unwrap_or_default());
                }
                Ok(StreamEvent::Done) => {
                    return self.complete_turn(session.id, reply, tool_calls);
                }
                Ok(StreamEvent::Error(failure)) => {
                    let err = ApiClientError::api(failure.error, None);
                    return Err(self.fail_turn(session.id, err.into()));
                }
                Err(err) => return Err(self.fail_turn(session.id, err.into())),
            }
        }

        let err = ApiClientError::network("Stream ended before completion");
        Err(self.fail_turn(session.id, err.into()))
    }

    /// Executes the pending tool call of the current session.
    pub async fn confirm_tool_call(&self, tool_call: &ToolCall) -> Result<ToolOutcome, SessionError> {
        let (session_id, coordinator, call, messages) = {
            let mut inner = self.inner.write();
            let id = inner.current_id()?;
            let (session, runtime) = inner.parts_mut(id)?;
            if runtime.phase != SessionPhase::AwaitingToolConfirmation {
                return Err(SessionError::NoPendingToolCall);
            }
            let call = runtime.tools.take(tool_call)?;
            runtime.phase = SessionPhase::ExecutingTool;
            (id, runtime.tools.clone(), call, session.messages.clone())
        };
        self.observers.notify(&StoreEvent::Changed {
            session_id: Some(session_id),
        });

        let outcome = match coordinator
            .execute(self.backend.as_ref(), call, session_id, messages)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail_turn(session_id, err)),
        };

        let snapshot = {
            let mut inner = self.inner.write();
            let (session, runtime) = inner.parts_mut(session_id)?;
            session.push_message(Message::tool_result(
                outcome.tool_call.id.clone(),
                outcome.result.clone(),
            ));
            if let Some(reply) = &outcome.reply {
                session.push_message(Message::assistant(reply.clone()));
            }
            runtime.error = None;
            runtime.phase = match runtime.tools.advance() {
                Some(_) => SessionPhase::AwaitingToolConfirmation,
                None => SessionPhase::Idle,
            };
            session.clone()
        };
        self.after_mutation(&snapshot);
        Ok(outcome)
    }

    /// Declines the pending tool call and every call queued behind it.
    pub fn cancel_tool_call(&self) -> Result<ToolCall, SessionError> {
        let (cancelled, snapshot) = {
            let mut inner = self.inner.write();
            let id = inner.current_id()?;
            let (session, runtime) = inner.parts_mut(id)?;
            let cancelled = runtime.tools.cancel()?;
            runtime.phase = SessionPhase::Idle;
            session.push_message(Message::assistant(TOOL_CANCELLED_MESSAGE));
            (cancelled, session.clone())
        };
        info!(session_id = %snapshot.id, tool = cancelled.name(), "tool call cancelled");
        self.after_mutation(&snapshot);
        Ok(cancelled)
    }

    /// Case-insensitive match on titles and message contents. A blank query
    /// returns every session in order.
    pub fn search_sessions(&self, query: &str) -> Vec<Session> {
        let inner = self.inner.read();
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return inner.sessions.clone();
        }
        inner
            .sessions
            .iter()
            .filter(|session| session.matches(&needle))
            .cloned()
            .collect()
    }

    pub fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage, SessionError> {
        let inner = self.inner.read();
        Ok(query.apply(&inner.sessions)?)
    }

    pub fn export_history(&self) -> HistoryExport {
        HistoryExport::new(self.sessions())
    }

    /// Merges an export, keeping whichever copy of a session is newer.
    /// Returns how many sessions were added or replaced.
    pub fn import_history(&self, export: HistoryExport) -> usize {
        let merged: Vec<Session> = {
            let mut inner = self.inner.write();
            let mut merged = Vec::new();
            for incoming in export.sessions {
                match inner.sessions.iter_mut().find(|s| s.id == incoming.id) {
                    Some(existing) if incoming != *existing && incoming.is_newer_than(existing) => {
                        *existing = incoming.clone();
                        merged.push(incoming);
                    }
                    Some(_) => {}
                    None => {
                        inner.sessions.push(incoming.clone());
                        merged.push(incoming);
                    }
                }
            }
            inner.sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            merged
        };
        if let Err(err) = self.transcripts.upsert_many(&merged) {
            warn!(%err, "failed to persist imported sessions");
        }
        info!(imported = merged.len(), "imported chat history");
        self.observers.notify(&StoreEvent::Changed { session_id: None });
        merged.len()
    }

    /// Shared preconditions and optimistic append for both send paths.
    fn begin_turn(&self, content: &str) -> Result<Session, SessionError> {
        let snapshot = {
            let mut inner = self.inner.write();
            let id = inner.current_id()?;
            let content = content.trim();
            if content.is_empty() {
                return Err(SessionError::EmptyMessage);
            }
            let (session, runtime) = inner.parts_mut(id)?;
            if !runtime.can_send() {
                return Err(SessionError::Busy);
            }
            runtime.phase = SessionPhase::Sending;
            runtime.error = None;
            session.push_message(Message::user(content));
            session.clone()
        };
        debug!(session_id = %snapshot.id, "sending message");
        self.after_mutation(&snapshot);
        Ok(snapshot)
    }

    async fn chat_request(&self, session: &Session) -> Result<ChatRequest, SessionError> {
        let ProviderCredentials { api_key, base_url } = self.keys.resolve(session.provider).await?;
        let defaults = &self.defaults;
        let mut request = ChatRequest::new(
            session.id,
            session.provider,
            session.model.clone(),
            session.messages.clone(),
        );
        request.api_key = api_key;
        request.base_url = base_url;
        request.system_prompt = defaults.system_prompt.clone();
        request.temperature = defaults.temperature;
        request.max_tokens = defaults.max_tokens;
        request.available_tools = defaults
            .available_tools
            .iter()
            .filter(|tool| session.tool_servers.contains(&tool.server_id))
            .cloned()
            .collect();
        Ok(request)
    }

    fn complete_turn(
        &self,
        session_id: Uuid,
        reply: String,
        tool_calls: Vec<ToolCall>,
    ) -> Result<Message, SessionError> {
        let (message, snapshot) = {
            let mut inner = self.inner.write();
            let (session, runtime) = inner.parts_mut(session_id)?;
            session.push_message(Message::assistant_with_tools(reply, tool_calls.clone()));
            runtime.error = None;
            runtime.phase = match runtime.tools.set_pending(tool_calls) {
                Some(pending) => {
                    info!(%session_id, tool = pending.name(), "tool call awaiting confirmation");
                    SessionPhase::AwaitingToolConfirmation
                }
                None => SessionPhase::Idle,
            };
            (last_message(session)?, session.clone())
        };
        self.after_mutation(&snapshot);
        Ok(message)
    }

    /// Records `err` in the transcript and on the session, emits an error
    /// event, and hands the error back for the caller.
    fn fail_turn(&self, session_id: Uuid, err: SessionError) -> SessionError {
        let message = err.to_string();
        warn!(%session_id, error = %message, "chat turn failed");
        let snapshot = {
            let mut inner = self.inner.write();
            match inner.parts_mut(session_id) {
                Ok((session, runtime)) => {
                    runtime.phase = SessionPhase::Idle;
                    runtime.error = Some(message.clone());
                    runtime.tools.clear();
                    session.push_message(Message::assistant(format!("Error: {message}")));
                    Some(session.clone())
                }
                Err(_) => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.after_mutation(&snapshot);
        }
        self.observers.notify(&StoreEvent::Error {
            session_id,
            message,
        });
        err
    }

    /// Persistence, optional sync, change notification and title requests.
    /// Must be called without the state lock held.
    fn after_mutation(&self, snapshot: &Session) {
        if let Err(err) = self.transcripts.upsert(snapshot) {
            warn!(%err, session_id = %snapshot.id, "failed to persist session");
        }
        if self.defaults.sync_history {
            let backend = self.backend.clone();
            let session = snapshot.clone();
            self.spawn_best_effort(async move {
                if let Err(err) = backend.sync_session(&session).await {
                    warn!(%err, session_id = %session.id, "history sync failed");
                }
            });
        }
        self.observers.notify(&StoreEvent::Changed {
            session_id: Some(snapshot.id),
        });
        self.request_title(snapshot);
    }

    fn request_title(&self, snapshot: &Session) {
        if snapshot.messages.len() < 2 || !snapshot.has_sentinel_title() {
            return;
        }
        {
            let mut inner = self.inner.write();
            let Some(runtime) = inner.runtime.get_mut(&snapshot.id) else {
                return;
            };
            if runtime.title_requested {
                return;
            }
            runtime.title_requested = true;
        }

        let store = self.clone();
        let session_id = snapshot.id;
        self.spawn_best_effort(async move {
            match store.backend.generate_title(session_id).await {
                Ok(title) => store.apply_generated_title(session_id, &title),
                Err(err) => warn!(%err, %session_id, "title generation failed"),
            }
        });
    }

    fn apply_generated_title(&self, session_id: Uuid, title: &str) {
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        let snapshot = {
            let mut inner = self.inner.write();
            let Ok((session, _)) = inner.parts_mut(session_id) else {
                return;
            };
            if !session.has_sentinel_title() {
                return;
            }
            session.title = title.to_string();
            session.touch();
            session.clone()
        };
        self.after_mutation(&snapshot);
    }

    fn spawn_best_effort<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => debug!("no async runtime; skipping background task"),
        }
    }
}

fn last_message(session: &Session) -> Result<Message, SessionError> {
    session
        .messages
        .last()
        .cloned()
        .ok_or(SessionError::SessionNotFound(session.id))
}
