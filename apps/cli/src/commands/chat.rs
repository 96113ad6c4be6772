//! One turn against a live conversation endpoint.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tessera_stream::{Attachment, FlowOrchestrator, HttpTransport, StreamConfig};
use tracing::info;

use super::run_session;

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Message to send
    pub content: String,

    /// Conversation the message belongs to
    #[arg(long)]
    pub conversation: String,

    /// Backend model (overrides TESSERA_MODEL and config)
    #[arg(long)]
    pub model: Option<String>,

    /// Sampling temperature, 0 to 2
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum number of tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// System prompt
    #[arg(long)]
    pub system: Option<String>,

    /// File to attach (repeatable)
    #[arg(long = "attach", value_name = "PATH")]
    pub attachments: Vec<PathBuf>,

    /// Print text as it arrives instead of revealing it character by character
    #[arg(long)]
    pub no_typewriter: bool,
}

/// Execute the chat command
pub async fn execute(args: ChatArgs, mut config: StreamConfig) -> Result<ExitCode> {
    apply_overrides(&args, &mut config);
    config.validate().context("Invalid configuration")?;

    let mut options = config.stream_options();
    options.attachments = read_attachments(&args.attachments)?;

    let transport = HttpTransport::from_config(&config)
        .context("No endpoint configured. Set TESSERA_ENDPOINT or `endpoint` in ~/.tessera/config.toml")?;
    info!(url = %transport.stream_url(&args.conversation), "Opening chat stream");

    let session = FlowOrchestrator::new(Arc::new(transport), config).start(args.conversation, args.content, options);
    run_session(session).await
}

/// Layers the command-line flags over the loaded configuration.
fn apply_overrides(args: &ChatArgs, config: &mut StreamConfig) {
    if let Some(model) = &args.model {
        config.model.model_id = Some(model.clone());
    }
    if let Some(temperature) = args.temperature {
        config.model.temperature = Some(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        config.model.max_tokens = Some(max_tokens);
    }
    if let Some(system) = &args.system {
        config.model.system_prompt = Some(system.clone());
    }
    if args.no_typewriter {
        config.typewriter.enabled = Some(false);
    }
}

fn read_attachments(paths: &[PathBuf]) -> Result<Vec<Attachment>> {
    paths.iter().map(|path| read_attachment(path)).collect()
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(Attachment::from_bytes(name, mime.essence_str(), &bytes))
}
