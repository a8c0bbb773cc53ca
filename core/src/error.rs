use crate::keys::KeyError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the transport layer.
///
/// The variant decides the retry policy: see [`ApiClientError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiClientError {
    /// Caller-correctable request problem. Never retried.
    #[error("{message}")]
    Validation { message: String },

    /// The request never produced an HTTP response.
    #[error("Network error - please check your connection ({message})")]
    Network { message: String },

    /// A single attempt exceeded its deadline.
    #[error("Request timeout after {}s", after.as_secs())]
    Timeout { after: Duration },

    /// The caller aborted the request.
    #[error("Request cancelled")]
    Cancelled,

    /// Everything else, optionally with the HTTP status that produced it.
    #[error("{message}")]
    Api { message: String, status: Option<u16> },
}

impl ApiClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Api {
            message: message.into(),
            status,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { .. } => Some(400),
            Self::Timeout { .. } => Some(408),
            Self::Api { status, .. } => *status,
            Self::Network { .. } | Self::Cancelled => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::Timeout { .. } | Self::Cancelled => false,
            Self::Api {
                status: Some(status),
                ..
            } => !(400..500).contains(status),
            Self::Api { status: None, .. } | Self::Network { .. } => true,
        }
    }
}

/// Failures returned by `SessionStore` operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No active session")]
    NoActiveSession,
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("A request is already in progress for this session")]
    Busy,
    #[error("No tool call is awaiting confirmation")]
    NoPendingToolCall,
    #[error("Tool call {got} does not match the pending call {expected}")]
    ToolCallMismatch { expected: String, got: String },
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),
    #[error("Message {0} not found")]
    MessageNotFound(Uuid),
    #[error("Tool message references unknown tool call {0}")]
    UnknownToolCall(String),
    #[error("Title cannot be empty")]
    EmptyTitle,
    #[error(transparent)]
    Request(#[from] ApiClientError),
    #[error(transparent)]
    Key(#[from] KeyError),
}
