//! Line-oriented chat loop.
//!
//! Plain lines are sent as chat messages. Lines starting with `/` are
//! commands, see [`HELP`].

use anyhow::Result;
use parley_core::state::SessionPhase;
use parley_core::{LlmProviderKind, Message, SessionError, SessionStore, ToolCall};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;
use uuid::Uuid;

pub const HELP: &str = "\
Commands:
  /new                 start a new session
  /sessions            list sessions, newest first
  /load <id>           switch to a session (an id prefix is enough)
  /search <text>       find sessions by title or message text
  /rename <title>      rename the current session
  /delete [id]         delete a session (defaults to the current one)
  /status              show the current session state
  /help                show this help
  /quit                exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    New,
    Sessions,
    Load(String),
    Search(String),
    Rename(String),
    Delete(Option<String>),
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse_line(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };
        let (name, rest) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };
        let argument = (!rest.is_empty()).then(|| rest.to_string());
        match (name, argument) {
            ("new", _) => Self::New,
            ("sessions" | "ls", _) => Self::Sessions,
            ("load", Some(id)) => Self::Load(id),
            ("search", Some(text)) => Self::Search(text),
            ("rename", Some(title)) => Self::Rename(title),
            ("delete" | "rm", id) => Self::Delete(id),
            ("status", _) => Self::Status,
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit" | "q", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplOptions {
    pub provider: LlmProviderKind,
    pub model: String,
    pub stream: bool,
    pub auto_confirm_tools: bool,
    pub tool_servers: Vec<String>,
}

/// Parses a y/n answer. Anything other than an explicit yes declines.
pub fn confirms(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Printed by one-shot commands that cannot prompt. Pending tool calls are
/// not persisted, so the user has to ask again interactively.
pub fn unconfirmed_tool_notice(call: &ToolCall) -> String {
    format!(
        "(the model asked to run `{}`; it was not run. Continue this session with `parley chat` and ask again to confirm it there)",
        call.name()
    )
}

/// Resolves a full id or a unique id prefix against the stored sessions.
pub fn resolve_session_id(store: &SessionStore, needle: &str) -> Option<Uuid> {
    if let Ok(id) = Uuid::parse_str(needle) {
        return Some(id);
    }
    let needle = needle.to_lowercase();
    let mut matches = store
        .sessions()
        .into_iter()
        .filter(|session| session.id.to_string().starts_with(&needle));
    let first = matches.next()?;
    matches.next().is_none().then_some(first.id)
}

pub struct Repl {
    store: SessionStore,
    options: ReplOptions,
    lines: Lines<BufReader<Stdin>>,
}

impl Repl {
    pub fn new(store: SessionStore, options: ReplOptions) -> Self {
        Self {
            store,
            options,
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Runs until `/quit` or end of input. Returns the current session id
    /// so the caller can remember it.
    pub async fn run(mut self) -> Result<Option<Uuid>> {
        println!("parley: {} ({}). Type /help for commands.", self.options.provider, self.options.model);
        loop {
            prompt("> ")?;
            let Some(line) = self.lines.next_line().await? else {
                break;
            };
            match ReplCommand::parse_line(&line) {
                ReplCommand::Quit => break,
                ReplCommand::Empty => {}
                command => self.dispatch(command).await?,
            }
        }
        Ok(self.store.current_session().map(|session| session.id))
    }

    async fn dispatch(&mut self, command: ReplCommand) -> Result<()> {
        match command {
            ReplCommand::Send(text) => self.send(&text).await?,
            ReplCommand::New => {
                let session = self.new_session();
                println!("started session {}", session);
            }
            ReplCommand::Sessions => {
                for session in self.store.sessions() {
                    println!(
                        "{}  {}  ({} messages, {})",
                        session.id,
                        session.title,
                        session.messages.len(),
                        session.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            ReplCommand::Load(needle) => match resolve_session_id(&self.store, &needle) {
                Some(id) => match self.store.load_session(id) {
                    Ok(session) => {
                        println!("loaded '{}'", session.title);
                        for message in &session.messages {
                            print_message(message);
                        }
                    }
                    Err(err) => println!("{err}"),
                },
                None => println!("no unique session matches '{needle}'"),
            },
            ReplCommand::Search(text) => {
                let found = self.store.search_sessions(&text);
                if found.is_empty() {
                    println!("no sessions match '{text}'");
                }
                for session in found {
                    println!("{}  {}", session.id, session.title);
                }
            }
            ReplCommand::Rename(title) => match self.store.current_session() {
                Some(session) => report(self.store.rename_session(session.id, &title).map(|_| ())),
                None => println!("{}", SessionError::NoActiveSession),
            },
            ReplCommand::Delete(needle) => {
                let id = match needle {
                    Some(needle) => resolve_session_id(&self.store, &needle),
                    None => self.store.current_session().map(|session| session.id),
                };
                match id {
                    Some(id) => report(self.store.delete_session(id)),
                    None => println!("nothing to delete"),
                }
            }
            ReplCommand::Status => self.print_status(),
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Unknown(line) => println!("unknown command: {line}"),
            ReplCommand::Quit | ReplCommand::Empty => {}
        }
        Ok(())
    }

    fn new_session(&self) -> Uuid {
        self.store
            .create_session(
                self.options.provider,
                self.options.model.clone(),
                self.options.tool_servers.clone(),
            )
            .id
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        if self.store.current_session().is_none() {
            self.new_session();
        }
        let result = if self.options.stream {
            let outcome = self
                .store
                .send_message_streaming(text, |delta| {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                })
                .await;
            println!();
            outcome
        } else {
            self.store.send_message(text).await.inspect(print_message)
        };
        match result {
            Ok(_) => self.resolve_tool_calls().await,
            Err(err) => {
                println!("{err}");
                Ok(())
            }
        }
    }

    /// Walks the pending tool calls one by one, asking before each.
    async fn resolve_tool_calls(&mut self) -> Result<()> {
        while let Some(call) = self.store.pending_tool_call() {
            if !self.ask_confirmation(&call).await? {
                report(self.store.cancel_tool_call().map(|_| ()));
                println!("tool call declined");
                break;
            }
            match self.store.confirm_tool_call(&call).await {
                Ok(outcome) => {
                    println!("[tool {}] {}", outcome.tool_call.name(), outcome.result);
                    if let Some(reply) = outcome.reply {
                        println!("{reply}");
                    }
                }
                Err(err) => {
                    println!("{err}");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn ask_confirmation(&mut self, call: &ToolCall) -> Result<bool> {
        println!(
            "model wants to run `{}` with {}",
            call.name(),
            call.function.arguments
        );
        if self.options.auto_confirm_tools {
            return Ok(true);
        }
        prompt("run it? [y/N] ")?;
        Ok(self
            .lines
            .next_line()
            .await?
            .is_some_and(|answer| confirms(&answer)))
    }

    fn print_status(&self) {
        let Some(session) = self.store.current_session() else {
            println!("no active session");
            return;
        };
        println!("{} '{}' [{} {}]", session.id, session.title, session.provider, session.model);
        if let Some(status) = self.store.status(session.id) {
            let phase = match status.phase {
                SessionPhase::Idle => "idle",
                SessionPhase::Sending => "sending",
                SessionPhase::AwaitingToolConfirmation => "awaiting tool confirmation",
                SessionPhase::ExecutingTool => "executing tool",
            };
            println!("phase: {phase}");
            if let Some(error) = status.error {
                println!("last error: {error}");
            }
        }
    }
}

fn prompt(text: &str) -> Result<()> {
    print!("{text}");
    std::io::stdout().flush()?;
    Ok(())
}

fn print_message(message: &Message) {
    println!("{}: {}", message.role, message.content);
}

fn report(result: Result<(), SessionError>) {
    if let Err(err) = result {
        warn!(%err, "command failed");
        println!("{err}");
    }
}
