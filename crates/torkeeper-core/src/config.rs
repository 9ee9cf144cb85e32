//! Manager configuration.
//!
//! Everything the lifecycle manager needs to know about the host: where Tor
//! lives, where its private data directory is, which control port both
//! sides agree on, and the timing of the connect sequence.

use crate::error::{Error, Result};
use crate::tor::{DEFAULT_CONTROL_ADDR, DEFAULT_CONTROL_PORT, DEFAULT_REPLY_TIMEOUT};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the control cookie file inside the data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Name of the torrc file inside the data directory.
pub const TORRC_FILE_NAME: &str = "torrc";

/// Name of the client onion-auth directory inside the data directory.
pub const AUTH_DIR_NAME: &str = "auth";

/// Configuration for the pluggable transport helper.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Path to the helper binary (lyrebird, obfs4proxy, ...).
    pub binary: PathBuf,
    /// Transports to request, e.g. `obfs4`, `meek_lite`.
    pub transports: Vec<String>,
    /// How long to wait for the helper to report its listeners.
    pub ready_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("lyrebird"),
            transports: vec!["obfs4".to_string(), "meek_lite".to_string()],
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for [`crate::lifecycle::OnionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Private data directory for Tor. Without one no cookie can be located.
    pub data_dir: Option<PathBuf>,
    /// Tor binary to launch.
    pub tor_binary: PathBuf,
    /// Loopback control port address.
    pub control_addr: SocketAddr,
    /// Limit for connecting to the control port and for each reply.
    pub control_timeout: Duration,
    /// Wait between launching Tor and the first control connection.
    pub grace_delay: Duration,
    /// Bootstrap stall watchdog delay.
    pub watchdog_delay: Duration,
    /// Interval at which a stopping engine is polled for exit.
    pub stop_poll_interval: Duration,
    /// Interval between host connectivity probes.
    pub reachability_interval: Duration,
    /// Forward Tor's log output through `tracing`.
    pub engine_logging: bool,
    /// Bridge lines used for [`crate::bridges::BridgesType::BuiltIn`].
    pub builtin_bridges: Vec<String>,
    /// Pluggable transport helper, if any.
    pub transport: Option<TransportConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            tor_binary: PathBuf::from("tor"),
            control_addr: SocketAddr::new(IpAddr::V4(DEFAULT_CONTROL_ADDR), DEFAULT_CONTROL_PORT),
            control_timeout: DEFAULT_REPLY_TIMEOUT,
            grace_delay: Duration::from_secs(1),
            watchdog_delay: Duration::from_secs(30),
            stop_poll_interval: Duration::from_secs(5),
            reachability_interval: Duration::from_secs(10),
            engine_logging: false,
            builtin_bridges: Vec::new(),
            transport: None,
        }
    }
}

impl ManagerConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }

    /// Path of the torrc file.
    pub fn torrc_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(TORRC_FILE_NAME))
    }

    /// Path of the client onion-auth directory.
    pub fn auth_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(AUTH_DIR_NAME))
    }

    /// Path of the control cookie.
    pub fn cookie_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(COOKIE_FILE_NAME))
    }

    /// Create the data and auth directories and an empty torrc if missing.
    pub fn prepare_data_dir(&self) -> Result<()> {
        let data_dir = self
            .data_dir
            .as_deref()
            .ok_or_else(|| Error::Config("no data directory configured".into()))?;
        std::fs::create_dir_all(data_dir)?;
        if let Some(auth_dir) = self.auth_dir() {
            std::fs::create_dir_all(auth_dir)?;
        }
        if let Some(torrc) = self.torrc_path() {
            if !torrc.exists() {
                std::fs::write(&torrc, b"")?;
            }
        }
        Ok(())
    }

    /// Read the control cookie.
    ///
    /// Fails with [`Error::MissingCookieFile`] when there is no data
    /// directory or the cookie has not been written yet.
    pub fn read_cookie(&self) -> Result<Vec<u8>> {
        let path = self.cookie_path().ok_or(Error::MissingCookieFile)?;
        read_cookie_file(&path)
    }
}

fn read_cookie_file(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(cookie) => Ok(cookie),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingCookieFile),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.control_addr.port(), DEFAULT_CONTROL_PORT);
        assert!(config.control_addr.ip().is_loopback());
        assert_eq!(config.watchdog_delay, Duration::from_secs(30));
        assert_eq!(config.stop_poll_interval, Duration::from_secs(5));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_paths_follow_data_dir() {
        let config = ManagerConfig::with_data_dir("/var/lib/torkeeper");
        assert_eq!(
            config.cookie_path(),
            Some(PathBuf::from("/var/lib/torkeeper/control_auth_cookie"))
        );
        assert_eq!(config.auth_dir(), Some(PathBuf::from("/var/lib/torkeeper/auth")));
        assert_eq!(config.torrc_path(), Some(PathBuf::from("/var/lib/torkeeper/torrc")));
    }

    #[test]
    fn test_cookie_without_data_dir() {
        let config = ManagerConfig::default();
        assert!(matches!(config.read_cookie(), Err(Error::MissingCookieFile)));
    }

    #[test]
    fn test_cookie_file_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ManagerConfig::with_data_dir(dir.path());
        assert!(matches!(config.read_cookie(), Err(Error::MissingCookieFile)));
        // Reading must not create anything.
        assert!(!dir.path().join(COOKIE_FILE_NAME).exists());
    }

    #[test]
    fn test_prepare_and_read_cookie() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("tor");
        let config = ManagerConfig::with_data_dir(&data_dir);
        config.prepare_data_dir().expect("prepare");
        assert!(data_dir.join(AUTH_DIR_NAME).is_dir());
        assert!(data_dir.join(TORRC_FILE_NAME).is_file());

        std::fs::write(data_dir.join(COOKIE_FILE_NAME), [7u8; 32]).expect("write cookie");
        assert_eq!(config.read_cookie().expect("cookie"), vec![7u8; 32]);
    }
}
