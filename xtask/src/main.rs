use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use parley_core::{
    telemetry, ConfiguredKeys, LlmProviderKind, MockBackend, MockReply, SessionStore, ToolCall,
    TranscriptStore,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parley")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test that exercises the Parley session engine.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let backend = MockBackend::new();
    let store = SessionStore::new(
        Arc::new(backend.clone()),
        Arc::new(ConfiguredKeys::new()),
        TranscriptStore::new(temp_dir.path().to_path_buf()),
    );
    let session = store.create_session(LlmProviderKind::Mock, "mock", Vec::new());

    runtime.block_on(store.send_message("ping from xtask"))?;

    backend.push_reply(MockReply::tool_calls(vec![ToolCall::new(
        "smoke_call",
        "echo",
        r#"{"text":"hi"}"#,
    )]));
    runtime.block_on(store.send_message("run the echo tool"))?;
    let call = store
        .pending_tool_call()
        .ok_or_else(|| anyhow::anyhow!("mock tool call was not queued"))?;
    let outcome = runtime.block_on(store.confirm_tool_call(&call))?;
    info!(tool = outcome.tool_call.name(), result = %outcome.result, "tool call confirmed");

    let mut streamed = 0usize;
    runtime.block_on(store.send_message_streaming("stream this back", |_| streamed += 1))?;

    let reopened = SessionStore::new(
        Arc::new(MockBackend::new()),
        Arc::new(ConfiguredKeys::new()),
        TranscriptStore::new(temp_dir.path().to_path_buf()),
    );
    let saved = reopened.load_session(session.id)?;
    ensure!(
        saved.messages.len() == store.current_messages().len(),
        "persisted transcript is out of date"
    );
    info!(
        "messages" = saved.messages.len(),
        "stream_fragments" = streamed,
        "smoke test conversation saved"
    );

    Ok(())
}
