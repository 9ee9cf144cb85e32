//! torkeeper command-line interface
//!
//! Runs a supervised Tor client in the foreground and manages the bridge
//! configuration it starts with.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// torkeeper - keep a local Tor client connected
#[derive(Parser)]
#[command(name = "torkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.torkeeper")]
    data_dir: String,

    /// Tor binary
    #[arg(long, default_value = "tor")]
    tor: PathBuf,

    /// Tor control port
    #[arg(long, default_value_t = torkeeper_core::tor::DEFAULT_CONTROL_PORT)]
    control_port: u16,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start Tor and stay connected until interrupted
    Run {
        /// Pluggable transport helper (lyrebird, obfs4proxy)
        #[arg(long)]
        pt: Option<PathBuf>,

        /// File with one built-in bridge line per line
        #[arg(long)]
        builtin_bridges: Option<PathBuf>,

        /// Forward Tor's own log output
        #[arg(long)]
        engine_log: bool,
    },

    /// Show or change the bridge configuration
    Bridges {
        #[command(subcommand)]
        action: BridgesAction,
    },

    /// Print the control cookie of a running Tor
    Cookie,
}

#[derive(Subcommand)]
enum BridgesAction {
    /// Show the stored configuration
    Show,

    /// Store a new configuration
    Set {
        /// Bridge strategy
        #[arg(value_enum)]
        kind: BridgeKind,

        /// Bridge lines, for `custom`
        lines: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BridgeKind {
    None,
    Builtin,
    Custom,
}

impl From<BridgeKind> for torkeeper_core::BridgesType {
    fn from(kind: BridgeKind) -> Self {
        match kind {
            BridgeKind::None => Self::None,
            BridgeKind::Builtin => Self::BuiltIn,
            BridgeKind::Custom => Self::Custom,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Expand data directory
    let data_dir = PathBuf::from(shellexpand::tilde(&cli.data_dir).to_string());
    let options = commands::Options {
        data_dir,
        tor: cli.tor,
        control_port: cli.control_port,
    };

    let command = cli.command.unwrap_or(Commands::Run {
        pt: None,
        builtin_bridges: None,
        engine_log: false,
    });

    match command {
        Commands::Run {
            pt,
            builtin_bridges,
            engine_log,
        } => {
            commands::run(&options, pt, builtin_bridges.as_deref(), engine_log).await?;
        }
        Commands::Bridges { action } => match action {
            BridgesAction::Show => commands::show_bridges(&options)?,
            BridgesAction::Set { kind, lines } => {
                commands::set_bridges(&options, kind.into(), lines)?;
            }
        },
        Commands::Cookie => commands::show_cookie(&options)?,
    }

    Ok(())
}
