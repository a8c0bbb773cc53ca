use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use parley::{
    build_store, default_settings_path, load_user_settings, save_user_settings, BackendChoice,
    unconfirmed_tool_notice, Repl, ReplOptions,
};
use parley_core::history::{SortBy, SortOrder};
use parley_core::{telemetry, ClientConfig, HistoryExport, HistoryQuery, LlmProviderKind};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal chat client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Answer from the built-in mock backend instead of the chat server.
    #[arg(long, global = true)]
    offline: bool,
    #[arg(long, global = true)]
    provider: Option<LlmProviderKind>,
    #[arg(long, global = true)]
    model: Option<String>,
    /// Stream replies as they arrive (default) or wait for the full reply.
    #[arg(long, global = true)]
    stream: Option<bool>,
    /// Transcript directory, overriding the configured one.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat (the default).
    Chat,
    /// Send one message in a fresh session and print the reply.
    Ask { message: Vec<String> },
    /// List stored sessions.
    History {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, value_enum, default_value_t = SortArg::Updated)]
        sort: SortArg,
        #[arg(long)]
        ascending: bool,
    },
    Export { out: PathBuf },
    Import { file: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SortArg {
    Created,
    Updated,
    Title,
}

impl From<SortArg> for SortBy {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Created => SortBy::CreatedAt,
            SortArg::Updated => SortBy::UpdatedAt,
            SortArg::Title => SortBy::Title,
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::env_filter_or_default())?;

    let cli = Cli::parse();
    let config = match ClientConfig::load_or_default() {
        Ok(config) => config,
        Err(err) => anyhow::bail!(err.user_message()),
    };

    let runtime = Runtime::new()?;
    let settings_path = default_settings_path();
    let mut settings = runtime.block_on(load_user_settings(&settings_path))?;

    let provider = cli
        .provider
        .or(settings.provider)
        .unwrap_or(config.provider);
    let model = cli
        .model
        .clone()
        .or_else(|| settings.model.clone())
        .unwrap_or_else(|| {
            if provider == config.provider {
                config.model.clone()
            } else {
                provider.default_model().to_string()
            }
        });
    let choice = BackendChoice::resolve(cli.offline, provider);
    let store = build_store(&config, choice, cli.data_dir.clone());

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            if let Some(last) = settings.last_session {
                if let Err(err) = store.load_session(last) {
                    warn!(%err, "last session is gone");
                }
            }
            let options = ReplOptions {
                provider,
                model,
                stream: cli.stream.unwrap_or(settings.stream),
                auto_confirm_tools: settings.auto_confirm_tools,
                tool_servers: settings.tool_servers.clone(),
            };
            let last = runtime.block_on(Repl::new(store, options).run())?;
            settings.last_session = last;
            runtime.block_on(save_user_settings(&settings_path, &settings))?;
        }
        Command::Ask { message } => {
            let message = message.join(" ");
            anyhow::ensure!(!message.trim().is_empty(), "nothing to ask");
            let session = store.create_session(provider, model, settings.tool_servers.clone());
            settings.last_session = Some(session.id);
            runtime.block_on(save_user_settings(&settings_path, &settings))?;
            let reply = runtime.block_on(store.send_message(&message))?;
            println!("{}", reply.content);
            if let Some(call) = store.pending_tool_call() {
                println!("{}", unconfirmed_tool_notice(&call));
            }
        }
        Command::History {
            query,
            limit,
            offset,
            sort,
            ascending,
        } => {
            let query = HistoryQuery {
                limit,
                offset,
                query,
                provider: cli.provider,
                sort_by: sort.into(),
                sort_order: if ascending { SortOrder::Asc } else { SortOrder::Desc },
            };
            let page = store.query_history(&query)?;
            for summary in &page.sessions {
                println!(
                    "{}  {:<50}  {:>3} msgs  {}",
                    summary.id,
                    summary.title,
                    summary.message_count,
                    summary.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!(
                "{} of {} sessions{}",
                page.sessions.len(),
                page.total,
                if page.has_more { " (more with --offset)" } else { "" }
            );
        }
        Command::Export { out } => {
            let export = store.export_history();
            let file = File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &export)?;
            writer.flush()?;
            info!(sessions = export.sessions.len(), path = %out.display(), "exported history");
            println!("Exported {} sessions to {}", export.sessions.len(), out.display());
        }
        Command::Import { file } => {
            let reader = File::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            let export: HistoryExport = serde_json::from_reader(BufReader::new(reader))
                .with_context(|| format!("{} is not a history export", file.display()))?;
            let merged = store.import_history(export);
            println!("Imported {merged} sessions from {}", file.display());
        }
    }

    Ok(())
}
