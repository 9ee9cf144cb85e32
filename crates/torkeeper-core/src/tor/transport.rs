//! Pluggable transport helper in managed mode.
//!
//! The helper is told which client transports to open through environment
//! variables and answers on stdout with one `CMETHOD` line per listener,
//! terminated by `CMETHODS DONE`. Tor is then pointed at those listeners
//! with `ClientTransportPlugin` entries.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::tor::ConfEntry;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Conf key registering a transport listener with Tor.
pub const CLIENT_TRANSPORT_PLUGIN_KEY: &str = "ClientTransportPlugin";

/// A client listener reported by the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMethod {
    /// Transport name, e.g. `obfs4`.
    pub name: String,
    /// Proxy protocol, `socks4` or `socks5`.
    pub protocol: String,
    /// Listener address.
    pub addr: SocketAddr,
}

impl TransportMethod {
    /// `ClientTransportPlugin` entry for this listener.
    pub fn conf_entry(&self) -> ConfEntry {
        ConfEntry::new(
            CLIENT_TRANSPORT_PLUGIN_KEY,
            format!("\"{} {} {}\"", self.name, self.protocol, self.addr),
        )
    }
}

/// One line of managed-mode output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLine {
    /// `VERSION <v>`
    Version(String),
    /// `CMETHOD <name> <protocol> <addr>`
    Method(TransportMethod),
    /// `CMETHOD-ERROR <name> <message>`
    MethodError {
        /// Transport that failed.
        name: String,
        /// Helper's explanation.
        message: String,
    },
    /// `ENV-ERROR <message>`
    EnvError(String),
    /// `VERSION-ERROR <message>`
    VersionError(String),
    /// `CMETHODS DONE`
    Done,
    /// Anything else, e.g. `LOG` lines.
    Other(String),
}

/// Parse one line of helper output.
pub fn parse_transport_line(line: &str) -> TransportLine {
    let line = line.trim();
    let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match keyword {
        "VERSION" => TransportLine::Version(rest.to_string()),
        "CMETHODS" if rest == "DONE" => TransportLine::Done,
        "CMETHOD" => {
            let mut fields = rest.split_whitespace();
            let method = match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(protocol), Some(addr)) => {
                    addr.parse().ok().map(|addr| TransportMethod {
                        name: name.to_string(),
                        protocol: protocol.to_string(),
                        addr,
                    })
                }
                _ => None,
            };
            method.map_or_else(|| TransportLine::Other(line.to_string()), TransportLine::Method)
        }
        "CMETHOD-ERROR" => {
            let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
            TransportLine::MethodError {
                name: name.to_string(),
                message: message.to_string(),
            }
        }
        "ENV-ERROR" => TransportLine::EnvError(rest.to_string()),
        "VERSION-ERROR" => TransportLine::VersionError(rest.to_string()),
        _ => TransportLine::Other(line.to_string()),
    }
}

/// Read helper output until `CMETHODS DONE`.
///
/// Per-method errors are logged and skipped; environment and version errors
/// abort.
pub async fn read_methods<R>(lines: &mut Lines<R>) -> Result<Vec<TransportMethod>>
where
    R: AsyncBufRead + Unpin,
{
    let mut methods = Vec::new();
    while let Some(line) = lines.next_line().await? {
        match parse_transport_line(&line) {
            TransportLine::Version(version) => debug!(%version, "Transport protocol version"),
            TransportLine::Method(method) => {
                debug!(name = %method.name, addr = %method.addr, "Transport listener");
                methods.push(method);
            }
            TransportLine::MethodError { name, message } => {
                warn!(%name, %message, "Transport method failed");
            }
            TransportLine::EnvError(message) => {
                return Err(Error::Transport(format!("environment error: {message}")));
            }
            TransportLine::VersionError(message) => {
                return Err(Error::Transport(format!("version error: {message}")));
            }
            TransportLine::Done => return Ok(methods),
            TransportLine::Other(text) => debug!(%text, "Transport output"),
        }
    }
    Err(Error::Transport("helper exited before CMETHODS DONE".into()))
}

/// Starts the helper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportLauncher;

impl TransportLauncher {
    /// Launch the helper described by `config`, keeping its state under
    /// `state_dir`, and wait for its listeners.
    pub async fn launch(config: &TransportConfig, state_dir: &Path) -> Result<TransportProcess> {
        let mut child = Command::new(&config.binary)
            .env("TOR_PT_MANAGED_TRANSPORT_VER", "1")
            .env("TOR_PT_CLIENT_TRANSPORTS", config.transports.join(","))
            .env("TOR_PT_STATE_LOCATION", state_dir)
            .env("TOR_PT_EXIT_ON_STDIN_CLOSE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Transport(format!("failed to launch {}: {}", config.binary.display(), e))
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("helper stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let methods = tokio::time::timeout(config.ready_timeout, read_methods(&mut lines))
            .await
            .map_err(|_| Error::Timeout)??;

        info!(count = methods.len(), "Pluggable transports ready");
        tokio::spawn(drain(lines));

        Ok(TransportProcess {
            child,
            _stdin: stdin,
            methods,
        })
    }
}

async fn drain(mut lines: Lines<BufReader<ChildStdout>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(text = %line, "Transport output");
    }
}

/// A running helper. Killed when dropped.
#[derive(Debug)]
pub struct TransportProcess {
    child: Child,
    // Closing stdin asks the helper to exit.
    _stdin: Option<ChildStdin>,
    methods: Vec<TransportMethod>,
}

impl TransportProcess {
    /// Listeners the helper opened.
    pub fn methods(&self) -> &[TransportMethod] {
        &self.methods
    }

    /// `ClientTransportPlugin` entries for every listener.
    pub fn conf_entries(&self) -> Vec<ConfEntry> {
        self.methods.iter().map(TransportMethod::conf_entry).collect()
    }

    /// Kill the helper and wait for it.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to stop transport helper");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        let line = parse_transport_line("CMETHOD obfs4 socks5 127.0.0.1:45678");
        assert_eq!(
            line,
            TransportLine::Method(TransportMethod {
                name: "obfs4".into(),
                protocol: "socks5".into(),
                addr: "127.0.0.1:45678".parse().expect("addr"),
            })
        );
    }

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(parse_transport_line("VERSION 1"), TransportLine::Version("1".into()));
        assert_eq!(parse_transport_line("CMETHODS DONE"), TransportLine::Done);
        assert_eq!(
            parse_transport_line("CMETHOD-ERROR meek_lite no such transport"),
            TransportLine::MethodError {
                name: "meek_lite".into(),
                message: "no such transport".into(),
            }
        );
        assert_eq!(
            parse_transport_line("ENV-ERROR missing TOR_PT_STATE_LOCATION"),
            TransportLine::EnvError("missing TOR_PT_STATE_LOCATION".into())
        );
        assert_eq!(
            parse_transport_line("VERSION-ERROR no-version"),
            TransportLine::VersionError("no-version".into())
        );
        assert!(matches!(
            parse_transport_line("CMETHOD obfs4 socks5 not-an-addr"),
            TransportLine::Other(_)
        ));
        assert!(matches!(
            parse_transport_line("LOG SEVERITY=notice MESSAGE=hi"),
            TransportLine::Other(_)
        ));
    }

    #[test]
    fn test_conf_entry_is_quoted() {
        let method = TransportMethod {
            name: "meek_lite".into(),
            protocol: "socks5".into(),
            addr: "127.0.0.1:1234".parse().expect("addr"),
        };
        assert_eq!(
            method.conf_entry().to_string(),
            "ClientTransportPlugin=\"meek_lite socks5 127.0.0.1:1234\""
        );
    }

    #[tokio::test]
    async fn test_read_methods_until_done() {
        let output: &[u8] = b"VERSION 1\n\
            CMETHOD obfs4 socks5 127.0.0.1:1000\n\
            CMETHOD-ERROR snowflake unsupported\n\
            CMETHOD meek_lite socks5 127.0.0.1:1001\n\
            CMETHODS DONE\n\
            CMETHOD late socks5 127.0.0.1:1002\n";
        let mut lines = output.lines();
        let methods = read_methods(&mut lines).await.expect("methods");
        let names: Vec<_> = methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["obfs4", "meek_lite"]);
    }

    #[tokio::test]
    async fn test_read_methods_env_error() {
        let output: &[u8] = b"ENV-ERROR no state location\n";
        let result = read_methods(&mut output.lines()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_read_methods_eof_before_done() {
        let output: &[u8] = b"VERSION 1\nCMETHOD obfs4 socks5 127.0.0.1:1000\n";
        let result = read_methods(&mut output.lines()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TransportConfig {
            binary: "/nonexistent/torkeeper-test-pt".into(),
            ..Default::default()
        };
        let result = TransportLauncher::launch(&config, dir.path()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
