use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use smimegate_utils::{
    load_config, Config, MessageTransformer, OutgoingMessage, SmimeSignTransformer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Signs an outgoing message with the S/MIME credentials of its sender.
///
/// The message is read from stdin (or `--input`) and written, signed or
/// unchanged, to stdout (or `--output`). Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "smimegate")]
#[command(about = "S/MIME signing gate for outgoing messages")]
struct Args {
    /// Path to the TOML configuration file (defaults are used when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Envelope sender (MAIL FROM) of the message
    #[arg(short, long)]
    from: String,

    /// Envelope recipient (RCPT TO) of the message, may be repeated
    #[arg(short, long = "rcpt")]
    rcpts: Vec<String>,

    /// Read the message from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write the resulting message to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let shutdown = CancellationToken::new();
    let transformer = SmimeSignTransformer::from_config(&config.smime, shutdown.clone());

    // Ctrl-C kills the in-flight signing process
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling signing");
            shutdown.cancel();
        }
    });

    let raw = read_message(args.input.as_deref()).await?;
    let mut message = OutgoingMessage::new(args.from, args.rcpts.into_iter().collect(), raw);

    let message_id = message.message_id.clone();
    transformer
        .transform(&mut message)
        .await
        .with_context(|| format!("Failed to process message {message_id}"))?;

    info!(
        message_id = %message_id,
        signed = message.is_signed(),
        bytes = message.raw().len(),
        "Message processed"
    );
    write_message(args.output.as_deref(), message.raw()).await?;
    Ok(())
}

/// Reads the whole message from the file or, if none is given, from stdin.
async fn read_message(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read message from {}", path.display())),
        None => {
            let mut raw = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut raw)
                .await
                .context("Failed to read message from stdin")?;
            Ok(raw)
        }
    }
}

async fn write_message(path: Option<&Path>, raw: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write message to {}", path.display())),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(raw).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}
