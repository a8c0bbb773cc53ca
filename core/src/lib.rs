pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod http;
pub mod keys;
pub mod llm;
pub mod observer;
pub mod session;
pub mod sse;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod transport;

pub use api::{ChatRequest, ChatResponse, HttpChatBackend};
pub use config::{ClientConfig, ConfigError};
pub use error::{ApiClientError, SessionError};
pub use history::{HistoryExport, HistoryPage, HistoryQuery};
pub use keys::{ConfiguredKeys, KeyError, KeyResolver};
pub use llm::{ChatBackend, LlmProviderKind, MockBackend, MockReply};
pub use session::{Message, MessageRole, Session, ToolCall};
pub use sse::{StreamEvent, SseDecoder};
pub use state::{ChatDefaults, SessionPhase, SessionStatus, SessionStore, StoreEvent};
pub use store::TranscriptStore;
pub use tools::{ToolCallCoordinator, ToolOutcome};
pub use transport::{ApiClient, LoadingState, TransportSettings};
