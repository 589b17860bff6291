// EasyMesh Linux peer: relay signaling, WebRTC data channel, chat and file exchange.

mod config;
mod files;
mod runtime;
mod signaling;
mod transport;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mesh_core::{Role, SessionId};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mesh-linux", version, about = "Exchange files and chat with one peer over WebRTC")]
struct Cli {
    /// Config file (default: ~/.config/easymesh/config.toml, then /etc/easymesh/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and print its code
    Host {
        /// Files to send once the peer is connected
        files: Vec<PathBuf>,
    },
    /// Join an existing session
    Join {
        session: String,
        files: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mesh_linux=info,mesh_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(cli.config.as_deref())?;
    let (session, role, files) = match cli.command {
        Commands::Host { files } => (SessionId::generate_code(), Role::Initiator, files),
        Commands::Join { session, files } => {
            (SessionId::from(session.trim()), Role::Joiner, files)
        }
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(runtime::run(cfg, session, role, files))
}
