//! muxlink CLI: a thin probe over the engine for inspection and
//! debugging. `attach` streams engine events as JSON lines; the real
//! consumer of the library is a UI layer.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use muxlink::config::EngineConfig;
use muxlink::engine::TmuxEngine;
use muxlink::events::EngineEvent;

#[derive(Parser, Debug)]
#[command(name = "muxlink", version = env!("MUXLINK_VERSION"))]
struct Cli {
    /// Engine config file (TOML). Defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether the engine can run on this host.
    Status,
    /// List sessions with their workspace metadata.
    Sessions,
    /// Attach to (or create) a session and stream engine events.
    Attach {
        /// Workspace name; sanitized into the tmux session name.
        name: String,
        /// Working directory for a newly created session.
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging to stderr; stdout carries the event stream.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = TmuxEngine::new(config);

    match cli.command {
        Command::Status => {
            let status = engine.support_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Sessions => {
            for session in engine.list_sessions().await? {
                println!("{}", serde_json::to_string(&session)?);
            }
        }
        Command::Attach { name, cwd } => {
            let cwd = cwd.canonicalize()?;
            let mut events = engine.subscribe_events();
            let session = engine.create_or_attach_session(&name, &cwd).await?;
            info!(session = %session.id, "attached; streaming events, ctrl-c to detach");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event)?,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("detaching");
        }
    }

    Ok(())
}

fn print_event(event: &EngineEvent) -> Result<()> {
    let value = match event {
        EngineEvent::Output(output) => serde_json::json!({
            "kind": "output",
            "session": output.session,
            "pane_id": output.pane_id,
            "data": String::from_utf8_lossy(&output.data),
        }),
        EngineEvent::State(state) => serde_json::to_value(state)?,
        EngineEvent::Projection { session, diff } => serde_json::json!({
            "kind": "projection",
            "session": session,
            "diff": diff,
        }),
        EngineEvent::Degraded { session, reason } => serde_json::json!({
            "kind": "degraded",
            "session": session,
            "reason": reason,
        }),
    };
    println!("{value}");
    Ok(())
}
