//! Tor integration.
//!
//! ## Design
//!
//! torkeeper launches its own Tor process and drives it over the
//! ControlPort: cookie authentication, `STATUS_CLIENT` events for bootstrap
//! progress and circuit establishment, and `SETCONF`/`RESETCONF` for live
//! reconfiguration. Tor itself is never relaunched to change settings.
//!
//! The lifecycle state machine only sees the [`ControlChannel`] trait, which
//! [`ControlSession`] implements against a real control port.

mod controller;
mod events;
mod process;
mod transport;

pub use controller::{ControlSession, DEFAULT_REPLY_TIMEOUT};
pub use events::{parse_circuit_status, Circuit, CircuitHop, Reply, ReplyLine, StatusEvent};
pub use process::{
    EngineHandle, EngineLaunch, EngineMonitor, EngineSpawner, EngineStatus, ProcessSupervisor,
    TorProcessSpawner,
};
pub use transport::{
    parse_transport_line, TransportLauncher, TransportLine, TransportMethod, TransportProcess,
};

use crate::error::Result;
use std::future::Future;
use std::net::Ipv4Addr;
use tokio::sync::{mpsc, oneshot};

/// Loopback address of the control port.
pub const DEFAULT_CONTROL_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Control port shared with the launched Tor.
pub const DEFAULT_CONTROL_PORT: u16 = 39069;

/// A `key=value` configuration entry for `SETCONF`.
///
/// The value is sent as-is; values containing spaces must already be quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfEntry {
    /// Configuration key, e.g. `UseBridges`.
    pub key: String,
    /// Raw value.
    pub value: String,
}

impl ConfEntry {
    /// Create an entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for ConfEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Operations the lifecycle state machine needs from a control connection.
///
/// All methods take `&self`; implementations synchronise internally so the
/// channel can be shared with observer tasks.
pub trait ControlChannel: Send + Sync + 'static {
    /// Whether the transport is currently open.
    fn is_connected(&self) -> bool;

    /// Open the transport.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Authenticate with the control cookie and enable status events.
    fn authenticate(&self, cookie: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Fires once with `true` when a circuit is established.
    fn circuit_established(&self)
        -> impl Future<Output = Result<oneshot::Receiver<bool>>> + Send;

    /// Yields bootstrap progress values; closed after 100.
    fn bootstrap_progress(&self)
        -> impl Future<Output = Result<mpsc::UnboundedReceiver<u8>>> + Send;

    /// `SETCONF key=value`.
    fn set_conf(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// `SETCONF` with several entries in a single command.
    fn set_confs(&self, entries: &[ConfEntry]) -> impl Future<Output = Result<()>> + Send;

    /// `RESETCONF key`.
    fn reset_conf(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask Tor to drop and rebuild its network connections.
    fn reset_connection(&self) -> impl Future<Output = Result<()>> + Send;

    /// Fully built circuits.
    fn circuits(&self) -> impl Future<Output = Result<Vec<Circuit>>> + Send;

    /// Close circuits by id. `true` iff every close succeeded.
    fn close_circuits(&self, ids: &[String]) -> impl Future<Output = Result<bool>> + Send;

    /// Close the transport.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_entry_display() {
        assert_eq!(ConfEntry::new("UseBridges", "1").to_string(), "UseBridges=1");
    }

    #[test]
    fn test_default_control_endpoint() {
        assert!(DEFAULT_CONTROL_ADDR.is_loopback());
        assert_eq!(DEFAULT_CONTROL_PORT, 39069);
    }
}
