use crate::api::RunToolRequest;
use crate::error::SessionError;
use crate::llm::ChatBackend;
use crate::session::{Message, ToolCall};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of one confirmed tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub tool_call: ToolCall,
    pub result: String,
    pub reply: Option<String>,
}

/// Per-session holder of the tool call awaiting user confirmation.
///
/// Further calls from the same assistant turn wait in a queue and are
/// promoted one at a time by [`ToolCallCoordinator::advance`].
#[derive(Debug, Default)]
pub struct ToolCallCoordinator {
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<ToolCall>,
    queue: VecDeque<ToolCall>,
}

impl ToolCallCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous state. Returns the call that is now pending.
    pub fn set_pending(&self, tool_calls: Vec<ToolCall>) -> Option<ToolCall> {
        let mut slot = self.slot.lock();
        let mut calls: VecDeque<ToolCall> = tool_calls.into();
        slot.pending = calls.pop_front();
        slot.queue = calls;
        slot.pending.clone()
    }

    pub fn pending(&self) -> Option<ToolCall> {
        self.slot.lock().pending.clone()
    }

    pub fn queued(&self) -> Vec<ToolCall> {
        self.slot.lock().queue.iter().cloned().collect()
    }

    /// Validates `tool_call` against the pending slot and clears it.
    pub fn take(&self, tool_call: &ToolCall) -> Result<ToolCall, SessionError> {
        let mut slot = self.slot.lock();
        let pending = slot.pending.as_ref().ok_or(SessionError::NoPendingToolCall)?;
        if pending.id != tool_call.id {
            return Err(SessionError::ToolCallMismatch {
                expected: pending.id.clone(),
                got: tool_call.id.clone(),
            });
        }
        slot.pending.take().ok_or(SessionError::NoPendingToolCall)
    }

    /// Runs a call previously removed with [`take`](Self::take). A failure
    /// discards the rest of the queue.
    pub async fn execute(
        &self,
        backend: &dyn ChatBackend,
        tool_call: ToolCall,
        session_id: Uuid,
        messages: Vec<Message>,
    ) -> Result<ToolOutcome, SessionError> {
        info!(tool = tool_call.name(), id = %tool_call.id, %session_id, "executing tool call");
        let request = RunToolRequest {
            tool_call,
            session_id,
            messages,
        };
        match backend.run_tool(&request).await {
            Ok(response) => Ok(ToolOutcome {
                tool_call: request.tool_call,
                result: response.result,
                reply: response.reply.filter(|reply| !reply.trim().is_empty()),
            }),
            Err(err) => {
                warn!(%err, tool = request.tool_call.name(), "tool execution failed");
                self.slot.lock().queue.clear();
                Err(err.into())
            }
        }
    }

    /// Take-then-execute in one step.
    pub async fn confirm(
        &self,
        backend: &dyn ChatBackend,
        tool_call: &ToolCall,
        session_id: Uuid,
        messages: Vec<Message>,
    ) -> Result<ToolOutcome, SessionError> {
        let tool_call = self.take(tool_call)?;
        self.execute(backend, tool_call, session_id, messages).await
    }

    /// Promotes the next queued call, if any.
    pub fn advance(&self) -> Option<ToolCall> {
        let mut slot = self.slot.lock();
        if slot.pending.is_none() {
            slot.pending = slot.queue.pop_front();
        }
        slot.pending.clone()
    }

    /// Drops the pending call and the queue. Returns the dropped pending call.
    pub fn cancel(&self) -> Result<ToolCall, SessionError> {
        let mut slot = self.slot.lock();
        let pending = slot.pending.take().ok_or(SessionError::NoPendingToolCall)?;
        slot.queue.clear();
        Ok(pending)
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.queue.clear();
    }
}
