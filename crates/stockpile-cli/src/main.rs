//! stockpile - command line client for the inventory API.
//!
//! Signs in, keeps the session between runs, and issues authenticated
//! requests through the same refresh-aware gate the front end uses.

mod commands;

use std::io;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stockpile_core::Config;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stockpile", version, about = "Inventory API client")]
struct Cli {
    /// API base URL, e.g. http://localhost:3000/api
    #[arg(long, global = true, env = "STOCKPILE_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// End the session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Show session validity and expiry
    Status,
    /// Keep the session refreshed until Ctrl-C or idle timeout
    Watch,
    /// Create an account (does not sign in)
    Register {
        #[arg(short, long)]
        username: String,
        /// admin or user
        #[arg(short, long)]
        role: Option<String>,
    },
    /// GET an authenticated endpoint and print the JSON response
    Get { path: String },
    /// POST a JSON body to an authenticated endpoint
    Post { path: String, body: String },
    /// DELETE an authenticated resource
    Delete { path: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stockpile.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
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

    let loaded = Config::load();
    let _log_guard = init_tracing(loaded.as_ref().ok().and_then(|c| c.log_dir.as_deref()));

    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    info!(api = %config.api_base_url, "stockpile starting");

    let store = config.session_store()?;
    store.restore_from_storage();

    let result = match cli.command {
        Command::Login { username } => commands::login(&store, &config, username).await,
        Command::Logout => commands::logout(&store).await,
        Command::Whoami => commands::whoami(&store),
        Command::Status => commands::status(&store),
        Command::Watch => commands::watch(&store, &config).await,
        Command::Register { username, role } => {
            commands::register(&store, &username, role.as_deref()).await
        }
        Command::Get { path } => commands::get(&store, &path).await,
        Command::Post { path, body } => commands::post(&store, &path, &body).await,
        Command::Delete { path } => commands::delete(&store, &path).await,
    };

    store.shutdown();
    result
}
