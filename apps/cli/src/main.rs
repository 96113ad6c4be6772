//! Tessera CLI - terminal client for streamed assistant turns
//!
//! Provides a `tessera` command that sends one message to a conversation and
//! renders the assistant's turn as it streams, or replays a recorded event
//! stream through the same pipeline without a network.

mod commands;
mod config;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{chat, replay};

/// Tessera CLI - stream assistant turns to the terminal
#[derive(Parser, Debug)]
#[command(name = "tessera", author, version, about = "Stream assistant turns to the terminal")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file layered over the discovered ones
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the assistant's turn
    ///
    /// Connects to the configured endpoint and renders the reply as it
    /// arrives. Ctrl-C stops the turn.
    Chat(chat::ChatArgs),

    /// Replay a recorded event stream
    ///
    /// Feeds the file through the same decoding and reconciliation path as
    /// a live session, then prints the final turn. Exits non-zero when the
    /// turn did not complete.
    Replay(replay::ReplayArgs),
}

/// Maps the `--log-level` flag to a filter directive. `RUST_LOG` wins when set.
fn log_filter(level: &str) -> EnvFilter {
    let directive = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the rendered turn.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&args.log_level))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let config = config::load(args.config.as_deref())?;

    match args.command {
        Command::Chat(chat_args) => chat::execute(chat_args, config).await,
        Command::Replay(replay_args) => replay::execute(&replay_args, config).await,
    }
}
