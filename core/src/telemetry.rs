use std::sync::OnceLock;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

static SUBSCRIBER_GUARD: OnceLock<()> = OnceLock::new();

/// Directives used when `RUST_LOG` is unset. The terminal shares stdout with
/// the chat, so only warnings are shown by default.
pub const DEFAULT_DIRECTIVES: &str = "parley=warn,parley_core=warn";

/// `RUST_LOG` when set and valid, else [`DEFAULT_DIRECTIVES`].
pub fn env_filter_or_default() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber, writing to stderr.
///
/// Idempotent, so tests and binaries may call it more than once.
pub fn init_tracing(filter: EnvFilter) -> Result<(), SetGlobalDefaultError> {
    if SUBSCRIBER_GUARD.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false));
    tracing::subscriber::set_global_default(subscriber)?;
    SUBSCRIBER_GUARD.set(()).ok();

    Ok(())
}
