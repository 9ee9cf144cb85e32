//! CLI command implementations.

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use torkeeper_core::{
    bridges::validate_bridge_line, tor::DEFAULT_CONTROL_ADDR, BridgeConfiguration,
    BridgeSettingsStore, BridgesType, JsonSettingsStore, ManagerConfig, OnionEvent,
    OnionManager, TransportConfig,
};

/// Settings file inside the data directory.
const SETTINGS_FILE: &str = "bridges.json";

/// Tor data directory inside the data directory.
const TOR_DIR: &str = "tor";

/// Options shared by every command.
pub struct Options {
    pub data_dir: PathBuf,
    pub tor: PathBuf,
    pub control_port: u16,
}

impl Options {
    fn store(&self) -> JsonSettingsStore {
        JsonSettingsStore::new(self.data_dir.join(SETTINGS_FILE))
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            tor_binary: self.tor.clone(),
            control_addr: SocketAddr::new(IpAddr::V4(DEFAULT_CONTROL_ADDR), self.control_port),
            ..ManagerConfig::with_data_dir(self.data_dir.join(TOR_DIR))
        }
    }
}

/// Run Tor in the foreground until Ctrl-C.
pub async fn run(
    options: &Options,
    pt: Option<PathBuf>,
    builtin_bridges: Option<&Path>,
    engine_log: bool,
) -> Result<()> {
    let mut config = options.manager_config();
    config.engine_logging = engine_log;
    if let Some(binary) = pt {
        config.transport = Some(TransportConfig {
            binary,
            ..Default::default()
        });
    }
    if let Some(path) = builtin_bridges {
        config.builtin_bridges = read_bridge_file(path)?;
    }

    let store = options.store();
    let manager = OnionManager::new(config, &store).context("Failed to load bridge settings")?;
    let mut events = manager.subscribe();
    manager.start().await.context("Failed to start Tor")?;

    println!("Starting Tor, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(OnionEvent::Progress(progress)) => println!("Bootstrapped {}%", progress),
                Ok(OnionEvent::PortsOpened) => println!("Control port open"),
                Ok(OnionEvent::Finished(configuration)) => {
                    println!("Connected ({:?} bridges)", configuration.bridges_type);
                    // Remember what worked.
                    if let Err(e) = store.save(&configuration) {
                        eprintln!("Failed to save bridge settings: {}", e);
                    }
                }
                Ok(OnionEvent::Difficulty(kind)) => {
                    eprintln!("{}: {}", kind.title(), kind.description());
                }
                Ok(OnionEvent::Warning(message)) => eprintln!("Warning: {}", message),
                Ok(OnionEvent::StateChanged(state)) => tracing::debug!(?state, "State changed"),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Missed events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("Stopping Tor...");
    let done = manager.stop().await.context("Failed to stop Tor")?;
    done.await.context("Tor did not report exit")?;
    manager.shutdown().await.context("Failed to shut down")?;
    println!("Stopped");
    Ok(())
}

/// Print the stored bridge configuration.
pub fn show_bridges(options: &Options) -> Result<()> {
    let configuration = options
        .store()
        .load()
        .context("Failed to load bridge settings")?;

    println!("Bridges: {:?}", configuration.bridges_type);
    if let Some(lines) = &configuration.custom_bridges {
        for line in lines {
            println!("  {}", line);
        }
    }
    Ok(())
}

/// Store a new bridge configuration.
pub fn set_bridges(options: &Options, bridges_type: BridgesType, lines: Vec<String>) -> Result<()> {
    if bridges_type == BridgesType::Custom && lines.is_empty() {
        bail!("custom bridges need at least one bridge line");
    }
    for line in &lines {
        validate_bridge_line(line).with_context(|| format!("Invalid bridge line: {}", line))?;
    }

    let custom = (bridges_type == BridgesType::Custom).then_some(lines);
    let configuration = BridgeConfiguration::new(bridges_type, custom);
    options
        .store()
        .save(&configuration)
        .context("Failed to save bridge settings")?;

    println!("Saved. Takes effect on the next start.");
    Ok(())
}

/// Print the control cookie as hex.
pub fn show_cookie(options: &Options) -> Result<()> {
    let cookie = options
        .manager_config()
        .read_cookie()
        .context("No control cookie; is Tor running?")?;
    println!("{}", hex::encode(cookie));
    Ok(())
}

fn read_bridge_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();
    for line in &lines {
        validate_bridge_line(line).with_context(|| format!("Invalid bridge line: {}", line))?;
    }
    Ok(lines)
}
