//! authsync - sign in to Supabase Auth from the terminal and keep the session
//! in step with the local cache.
//!
//! Each subcommand plays the part of a view: it reads the shared session
//! state, runs an action, or asks the route guard whether a protected
//! location may be shown.

mod app;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

/// Log file name prefix inside `--log-file DIR`
const LOG_FILE_PREFIX: &str = "authsync.log";

#[derive(Parser, Debug)]
#[command(name = "authsync")]
#[command(about = "Keep a Supabase Auth session in step with a local cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Keep the session mirror in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Also write logs to a daily-rolling file in DIR
    #[arg(long, value_name = "DIR", global = true)]
    log_file: Option<PathBuf>,

    /// Print states and decisions as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the session: the cached one right away, then the confirmed one
    Status,

    /// Sign in with email and password
    Login {
        /// Account email (prompted for if missing)
        #[arg(short, long, env = "AUTHSYNC_EMAIL")]
        email: Option<String>,

        /// Location to continue to after signing in
        #[arg(long)]
        return_to: Option<String>,
    },

    /// Create an account
    Signup {
        /// Account email
        email: String,
    },

    /// Sign out locally and at the provider
    Logout,

    /// Ask the provider for the current session
    Refresh,

    /// Check whether a protected location may be shown
    Guard {
        /// Requested location, e.g. /dashboard
        location: String,
    },

    /// Print every session change until Ctrl-C
    Watch,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Flushes the log file on drop
    let _log_guard = init_tracing(cli.log_file.as_deref());
    info!("authsync starting");

    let mut app = App::new(cli.ephemeral, cli.json)?;
    let result = match cli.command {
        Command::Status => app.status().await,
        Command::Login { email, return_to } => app.login(email, return_to).await,
        Command::Signup { email } => app.signup(email).await,
        Command::Logout => app.logout().await,
        Command::Refresh => app.refresh().await,
        Command::Guard { location } => app.guard(location).await,
        Command::Watch => app.watch().await,
    };
    app.shutdown();

    info!("authsync finished");
    result
}
