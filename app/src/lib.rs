pub mod config;
pub mod engine;
pub mod repl;

pub use config::{default_settings_path, load_user_settings, save_user_settings, UserSettings};
pub use engine::{build_store, BackendChoice};
pub use repl::{unconfirmed_tool_notice, Repl, ReplCommand, ReplOptions};
