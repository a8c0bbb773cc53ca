use crate::llm::LlmProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Title every session starts with until the first user message replaces it.
pub const NEW_CHAT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;
const TITLE_KEEP_CHARS: usize = 47;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolFunction {
    pub name: String,
    /// JSON-encoded arguments, passed through untouched.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "ToolCall::function_kind")]
    pub kind: String,
    pub function: ToolFunction,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: Self::function_kind(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    fn function_kind() -> String {
        "function".to_string()
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Assistant turn that requested tools. An empty list is stored as `None`.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::assistant(content);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        message
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// Partial update applied by `SessionStore::update_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider: LlmProviderKind,
    pub model: String,
    #[serde(default, rename = "mcpServers")]
    pub tool_servers: Vec<String>,
    /// Bumped on every mutation; breaks `updated_at` ties when merging copies.
    #[serde(default)]
    pub revision: u64,
}

impl Session {
    pub fn new(provider: LlmProviderKind, model: impl Into<String>, tool_servers: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: NEW_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            provider,
            model: model.into(),
            tool_servers,
            revision: 0,
        }
    }

    pub fn has_sentinel_title(&self) -> bool {
        self.title == NEW_CHAT_TITLE
    }

    /// Appends a message, keeping timestamps non-decreasing. Returns `true`
    /// when the title was derived from this message.
    pub fn push_message(&mut self, mut message: Message) -> bool {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        let retitle = self.has_sentinel_title() && message.role == MessageRole::User;
        if retitle {
            self.title = generate_title(std::slice::from_ref(&message));
        }
        self.messages.push(message);
        self.touch();
        retitle
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now.max(self.updated_at);
        self.revision += 1;
    }

    /// Whether an assistant message in this session emitted `tool_call_id`.
    pub fn knows_tool_call(&self, tool_call_id: &str) -> bool {
        self.messages
            .iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .flat_map(|message| message.tool_calls())
            .any(|call| call.id == tool_call_id)
    }

    pub fn matches(&self, needle_lowercase: &str) -> bool {
        self.title.to_lowercase().contains(needle_lowercase)
            || self
                .messages
                .iter()
                .any(|message| message.content.to_lowercase().contains(needle_lowercase))
    }

    /// Ordering used when merging two copies of the same session.
    pub fn is_newer_than(&self, other: &Session) -> bool {
        (self.updated_at, self.revision) >= (other.updated_at, other.revision)
    }
}

/// Title derived from the first user message: verbatim up to 50 characters,
/// otherwise the first 47 followed by `...`.
pub fn generate_title(messages: &[Message]) -> String {
    let Some(first_user) = messages
        .iter()
        .find(|message| message.role == MessageRole::User)
    else {
        return NEW_CHAT_TITLE.to_string();
    };
    let content = first_user.content.trim();
    if content.chars().count() <= TITLE_MAX_CHARS {
        return content.to_string();
    }
    let mut title: String = content.chars().take(TITLE_KEEP_CHARS).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn short_first_message_becomes_the_title() {
        let messages = vec![Message::system("be nice"), Message::user("  Hi  ")];
        assert_eq!(generate_title(&messages), "Hi");
    }

    #[test]
    fn long_first_message_is_truncated_to_47_plus_ellipsis() {
        let content = "a".repeat(60);
        let title = generate_title(&[Message::user(content.clone())]);
        assert_eq!(title, format!("{}...", &content[..47]));
        assert_eq!(title.chars().count(), 50);
    }

    #[test]
    fn exactly_fifty_characters_is_kept() {
        let content = "b".repeat(50);
        assert_eq!(generate_title(&[Message::user(content.clone())]), content);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let content = "é".repeat(55);
        let title = generate_title(&[Message::user(content)]);
        assert_eq!(title, format!("{}...", "é".repeat(47)));
    }

    #[test]
    fn no_user_message_keeps_the_sentinel() {
        assert_eq!(generate_title(&[]), NEW_CHAT_TITLE);
        assert_eq!(
            generate_title(&[Message::assistant("hello there")]),
            NEW_CHAT_TITLE
        );
    }

    #[test]
    fn title_is_replaced_only_once() {
        let mut session = Session::new(LlmProviderKind::OpenAi, "gpt-4", Vec::new());
        assert!(session.push_message(Message::user("first question")));
        assert!(!session.push_message(Message::user("second question")));
        assert_eq!(session.title, "first question");
    }

    #[test]
    fn push_clamps_backwards_timestamps() {
        let mut session = Session::new(LlmProviderKind::OpenAi, "gpt-4", Vec::new());
        session.push_message(Message::user("now"));
        let mut stale = Message::assistant("from the past");
        stale.timestamp = Utc::now() - Duration::hours(1);
        session.push_message(stale);

        let stamps: Vec<_> = session.messages.iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(session.revision, 2);
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let mut session = Session::new(LlmProviderKind::DeepSeek, "deepseek-chat", vec!["fs".into()]);
        session.push_message(Message::assistant_with_tools(
            "",
            vec![ToolCall::new("call_1", "read_file", r#"{"path":"a.txt"}"#)],
        ));
        session.push_message(Message::tool_result("call_1", "contents"));

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["mcpServers"][0], "fs");
        assert_eq!(json["provider"], "deepseek");
        assert_eq!(json["messages"][0]["toolCalls"][0]["type"], "function");
        assert_eq!(json["messages"][1]["toolCallId"], "call_1");
        assert!(json["messages"][1].get("toolCalls").is_none());
        assert!(json.get("createdAt").is_some());
    }
}
