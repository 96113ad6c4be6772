//! Replays a recorded event stream without a network.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tessera_stream::{FlowOrchestrator, ScriptedTransport, StreamConfig};
use tracing::info;

use super::run_session;

const REPLAY_CONVERSATION: &str = "replay";

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Recorded `text/event-stream` body
    pub file: PathBuf,

    /// Print text as it arrives instead of revealing it character by character
    #[arg(long)]
    pub no_typewriter: bool,

    /// Bytes per delivered chunk, to exercise record reassembly
    #[arg(long, default_value_t = 64)]
    pub chunk_size: usize,
}

/// Execute the replay command
pub async fn execute(args: &ReplayArgs, mut config: StreamConfig) -> Result<ExitCode> {
    if args.no_typewriter {
        config.typewriter.enabled = Some(false);
    }
    config.validate().context("Invalid configuration")?;

    let wire = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read recording {}", args.file.display()))?;
    info!(file = %args.file.display(), bytes = wire.len(), "Replaying recording");

    let options = config.stream_options();
    let transport = ScriptedTransport::from_sse(&wire, args.chunk_size.max(1));
    let session =
        FlowOrchestrator::new(Arc::new(transport), config).start(REPLAY_CONVERSATION, String::new(), options);
    run_session(session).await
}
