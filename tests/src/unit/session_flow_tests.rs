use parley_core::history::{HistoryQuery, SortBy, SortOrder};
use parley_core::state::{SessionPhase, TOOL_CANCELLED_MESSAGE};
use parley_core::{
    ConfiguredKeys, LlmProviderKind, MessageRole, MockBackend, MockReply, SessionError,
    SessionStore, ToolCall, TranscriptStore,
};
use parley_tests::test_runtime;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn mock_store(backend: &MockBackend, data_dir: &Path) -> SessionStore {
    SessionStore::new(
        Arc::new(backend.clone()),
        Arc::new(ConfiguredKeys::new()),
        TranscriptStore::new(data_dir.to_path_buf()),
    )
}

#[test]
fn conversation_survives_a_restart() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();

    let session_id = {
        let store = mock_store(&backend, temp_dir.path());
        let session = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
        runtime
            .block_on(store.send_message("hello world"))
            .expect("send message");
        session.id
    };

    let reopened = mock_store(&backend, temp_dir.path());
    assert!(reopened.current_session().is_none());
    let session = reopened.load_session(session_id).expect("stored session");
    assert_eq!(session.title, "hello world");
    assert!(session
        .messages
        .iter()
        .any(|msg| msg.role == MessageRole::User));
    assert!(session
        .messages
        .iter()
        .any(|msg| msg.role == MessageRole::Assistant && msg.content.contains("hello world")));
}

#[test]
fn queued_tool_calls_are_confirmed_one_at_a_time() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let store = mock_store(&backend, temp_dir.path());
    store.create_session(LlmProviderKind::Mock, "mock", vec!["fs".to_string()]);

    let first = ToolCall::new("call_1", "read_file", r#"{"path":"a.txt"}"#);
    let second = ToolCall::new("call_2", "read_file", r#"{"path":"b.txt"}"#);
    backend.push_reply(MockReply::tool_calls(vec![first.clone(), second.clone()]));

    runtime
        .block_on(store.send_message("read both files"))
        .expect("send message");
    assert_eq!(store.pending_tool_call(), Some(first.clone()));

    let outcome = runtime
        .block_on(store.confirm_tool_call(&first))
        .expect("first tool");
    assert_eq!(outcome.result, "Mock result for tool: read_file");
    assert_eq!(store.pending_tool_call(), Some(second.clone()));

    let err = runtime
        .block_on(store.send_message("still there?"))
        .expect_err("tool call pending");
    assert_eq!(err, SessionError::Busy);

    runtime
        .block_on(store.confirm_tool_call(&second))
        .expect("second tool");
    assert!(store.pending_tool_call().is_none());
    assert!(store.can_send_message());
    assert_eq!(backend.tool_requests().len(), 2);
}

#[test]
fn declining_a_tool_call_drops_the_queue() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let store = mock_store(&backend, temp_dir.path());
    let session = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
    backend.push_reply(MockReply::tool_calls(vec![
        ToolCall::new("call_1", "delete_file", "{}"),
        ToolCall::new("call_2", "delete_file", "{}"),
    ]));

    runtime
        .block_on(store.send_message("clean up"))
        .expect("send message");
    let cancelled = store.cancel_tool_call().expect("cancel");
    assert_eq!(cancelled.id, "call_1");

    let status = store.status(session.id).expect("status");
    assert_eq!(status.phase, SessionPhase::Idle);
    assert!(status.queued_tool_calls.is_empty());
    assert_eq!(
        store.current_messages().last().expect("message").content,
        TOOL_CANCELLED_MESSAGE
    );
    assert!(backend.tool_requests().is_empty());
}

#[test]
fn streamed_and_batched_replies_agree() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let store = mock_store(&backend, temp_dir.path());
    store.create_session(LlmProviderKind::Mock, "mock", Vec::new());

    let batched = runtime
        .block_on(store.send_message("same prompt"))
        .expect("batched");
    let mut streamed_text = String::new();
    let streamed = runtime
        .block_on(store.send_message_streaming("same prompt", |delta| {
            streamed_text.push_str(delta)
        }))
        .expect("streamed");

    assert_eq!(batched.content, streamed.content);
    assert_eq!(streamed_text, streamed.content);
}

#[test]
fn broken_stream_records_an_error_and_recovers() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let store = mock_store(&backend, temp_dir.path());
    let session = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
    backend.push_reply(MockReply::BrokenStream {
        partial: "half an ans".to_string(),
        error: "upstream closed".to_string(),
    });

    runtime
        .block_on(store.send_message_streaming("tell me", |_| {}))
        .expect_err("broken stream");
    let status = store.status(session.id).expect("status");
    assert_eq!(status.error.as_deref(), Some("upstream closed"));
    assert_eq!(
        store.current_messages().last().expect("message").content,
        "Error: upstream closed"
    );

    runtime
        .block_on(store.send_message_streaming("try again", |_| {}))
        .expect("recovered");
    assert!(store.status(session.id).expect("status").error.is_none());
}

#[test]
fn history_pages_and_export_round_trip() {
    let runtime = test_runtime();
    let source_dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let store = mock_store(&backend, source_dir.path());
    for topic in ["alpha", "beta", "gamma"] {
        store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
        runtime
            .block_on(store.send_message(&format!("notes about {topic}")))
            .expect("send message");
    }

    let page = store
        .query_history(&HistoryQuery {
            limit: 2,
            sort_by: SortBy::Title,
            sort_order: SortOrder::Asc,
            ..HistoryQuery::default()
        })
        .expect("page");
    assert_eq!(page.total, 3);
    assert!(page.has_more);
    assert_eq!(page.sessions[0].title, "notes about alpha");

    let export = store.export_history();
    assert_eq!(export.metadata.total_sessions, 3);
    let encoded = serde_json::to_string(&export).expect("encode export");

    let target_dir = TempDir::new().expect("temp dir");
    let target = mock_store(&MockBackend::new(), target_dir.path());
    let decoded = serde_json::from_str(&encoded).expect("decode export");
    assert_eq!(target.import_history(decoded), 3);
    assert_eq!(target.search_sessions("GAMMA").len(), 1);

    let again = serde_json::from_str(&encoded).expect("decode export");
    assert_eq!(target.import_history(again), 0);
}

#[test]
fn deleting_the_current_session_clears_it() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = mock_store(&MockBackend::new(), temp_dir.path());
    let keep = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
    let doomed = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());

    store.delete_session(doomed.id).expect("delete");
    assert!(store.current_session().is_none());
    assert_eq!(store.sessions().len(), 1);
    assert_eq!(
        store.load_session(doomed.id),
        Err(SessionError::SessionNotFound(doomed.id))
    );

    let reopened = mock_store(&MockBackend::new(), temp_dir.path());
    assert_eq!(reopened.sessions()[0].id, keep.id);
}

#[test]
fn sessions_written_after_a_corrupt_snapshot_are_kept() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let snapshot = temp_dir.path().join("sessions.json");
    std::fs::write(&snapshot, "{not json").expect("corrupt snapshot");

    let store = mock_store(&MockBackend::new(), temp_dir.path());
    assert!(store.sessions().is_empty());
    let session = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());
    runtime
        .block_on(store.send_message("remember me"))
        .expect("send message");

    let reopened = mock_store(&MockBackend::new(), temp_dir.path());
    let saved = reopened.load_session(session.id).expect("saved session");
    assert_eq!(saved.messages.len(), 2);
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("sessions.json.corrupt"))
            .expect("corrupt copy kept"),
        "{not json"
    );
}
