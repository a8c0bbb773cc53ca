use parley_core::http::{HttpFault, Method};
use parley_core::state::SessionPhase;
use parley_core::{ApiClientError, LlmProviderKind, MessageRole, SessionError};
use parley_tests::{
    http_store, json_response, request_json, sse_response, test_runtime, FakeChatServer,
};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn batched_turn_posts_history_and_credentials() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|request| {
        if request.url.path().ends_with("/chat") {
            json_response(200, json!({ "reply": "Hi there" }))
        } else {
            json_response(404, json!({ "error": "Not found" }))
        }
    });
    let store = http_store(&server, temp_dir.path());
    store.create_session(LlmProviderKind::OpenAi, "gpt-4o-mini", Vec::new());

    let reply = runtime
        .block_on(store.send_message("hello"))
        .expect("send message");
    assert_eq!(reply.content, "Hi there");

    let chats = server.requests_to("/chat");
    assert_eq!(chats.len(), 1);
    let request = &chats[0];
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.header("X-Requested-With"), Some("XMLHttpRequest"));
    let body = request_json(request);
    assert_eq!(body["provider"], "openai");
    assert_eq!(body["apiKey"], "sk-test");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hello");
}

#[test]
fn streamed_reply_is_assembled_from_frames() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|request| {
        if request.url.path().ends_with("/chat/stream") {
            sse_response(&[
                r#"{"reply":"Hel","isStreaming":true}"#,
                r#"{"reply":"lo","isStreaming":true}"#,
                "[DONE]",
            ])
        } else {
            json_response(404, json!({ "error": "Not found" }))
        }
    });
    let store = http_store(&server, temp_dir.path());
    store.create_session(LlmProviderKind::OpenAi, "gpt-4o-mini", Vec::new());

    let mut deltas = Vec::new();
    let reply = runtime
        .block_on(store.send_message_streaming("hi", |delta| deltas.push(delta.to_string())))
        .expect("stream");
    assert_eq!(deltas, vec!["Hel", "lo"]);
    assert_eq!(reply.content, "Hello");
    let stream_request = &server.requests_to("/chat/stream")[0];
    assert_eq!(stream_request.header("Accept"), Some("text/event-stream"));
}

#[test]
fn stream_error_frame_fails_the_turn() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|_| {
        sse_response(&[
            r#"{"reply":"par","isStreaming":true}"#,
            r#"{"error":"model overloaded","isStreaming":false}"#,
        ])
    });
    let store = http_store(&server, temp_dir.path());
    let session = store.create_session(LlmProviderKind::OpenAi, "gpt-4o-mini", Vec::new());

    let err = runtime
        .block_on(store.send_message_streaming("hi", |_| {}))
        .expect_err("error frame");
    assert!(err.to_string().contains("model overloaded"));

    let status = store.status(session.id).expect("status");
    assert_eq!(status.phase, SessionPhase::Idle);
    assert!(status.error.is_some());
    let last = store.current_messages().pop().expect("error message");
    assert_eq!(last.role, MessageRole::Assistant);
    assert!(last.content.starts_with("Error: "));
}

#[test]
fn server_tool_call_round_trip() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|request| {
        let path = request.url.path();
        if path.ends_with("/chat") {
            json_response(
                200,
                json!({
                    "reply": "",
                    "toolCalls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "list_files", "arguments": "{\"dir\":\".\"}" }
                    }]
                }),
            )
        } else if path.ends_with("/run-tool") {
            json_response(200, json!({ "result": "a.txt\nb.txt", "reply": "Two files." }))
        } else {
            json_response(404, json!({ "error": "Not found" }))
        }
    });
    let store = http_store(&server, temp_dir.path());
    store.create_session(
        LlmProviderKind::OpenAi,
        "gpt-4o-mini",
        vec!["filesystem".to_string()],
    );

    runtime
        .block_on(store.send_message("what files are here?"))
        .expect("send message");
    let call = store.pending_tool_call().expect("pending tool call");
    assert_eq!(call.name(), "list_files");
    assert!(!store.can_send_message());

    let outcome = runtime
        .block_on(store.confirm_tool_call(&call))
        .expect("tool result");
    assert_eq!(outcome.result, "a.txt\nb.txt");
    assert!(store.can_send_message());

    let run_tool = &server.requests_to("/run-tool")[0];
    let body = request_json(run_tool);
    assert_eq!(body["toolCall"]["id"], "call_1");
    assert_eq!(body["toolCall"]["function"]["arguments"], "{\"dir\":\".\"}");

    let messages = store.current_messages();
    let tool_message = messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("tool message");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(messages.last().expect("reply").content, "Two files.");
}

#[test]
fn client_errors_surface_without_retry() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|_| json_response(401, json!({ "error": "Invalid API key" })));
    let backend = parley_core::HttpChatBackend::new(server.client(3));
    let store = parley_core::SessionStore::new(
        std::sync::Arc::new(backend),
        std::sync::Arc::new(parley_tests::test_keys()),
        parley_core::TranscriptStore::new(temp_dir.path().to_path_buf()),
    );
    store.create_session(LlmProviderKind::OpenAi, "gpt-4o-mini", Vec::new());

    let err = runtime
        .block_on(store.send_message("hello"))
        .expect_err("unauthorized");
    match err {
        SessionError::Request(ApiClientError::Api { message, status }) => {
            assert_eq!(message, "Invalid API key");
            assert_eq!(status, Some(401));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(server.requests_to("/chat").len(), 1);
}

#[test]
fn network_faults_are_retried() {
    let runtime = test_runtime();
    let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    let server = FakeChatServer::new(move |_| {
        if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
            Err(HttpFault::Network("connection reset".to_string()))
        } else {
            json_response(200, json!({ "ok": true }))
        }
    });
    let client = server.client(3);

    let body: serde_json::Value = runtime
        .block_on(client.get("/health"))
        .expect("third attempt succeeds");
    assert_eq!(body["ok"], true);
    assert_eq!(server.requests().len(), 3);
}

#[test]
fn missing_key_never_reaches_the_server() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let server = FakeChatServer::new(|_| json_response(200, json!({ "reply": "unreachable" })));
    let store = http_store(&server, temp_dir.path());
    store.create_session(LlmProviderKind::DeepSeek, "deepseek-chat", Vec::new());

    let err = runtime
        .block_on(store.send_message("hello"))
        .expect_err("no deepseek key");
    assert!(matches!(err, SessionError::Key(_)));
    assert!(server.requests_to("/chat").is_empty());
}
