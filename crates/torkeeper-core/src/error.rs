//! Error types for torkeeper.
//!
//! Lifecycle failures that the embedding application has to react to are
//! grouped under [`OnionErrorKind`]. Everything else is plumbing detail and
//! carries a message for the logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core error type for torkeeper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Tor did not finish bootstrapping before the stall watchdog fired.
    #[error("connection to the Tor network is taking longer than expected")]
    ConnectionDifficulty,

    /// The control cookie could not be read after connecting, which in
    /// practice means Tor never came up with the configured bridges.
    #[error("could not connect to Tor with the configured bridges")]
    InvalidBridges,

    /// No control cookie file is available.
    #[error("control auth cookie file is missing")]
    MissingCookieFile,

    /// Control port transport or protocol failure.
    #[error("control port error: {0}")]
    Control(String),

    /// Control port rejected our credentials.
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// Tor process could not be launched or supervised.
    #[error("engine error: {0}")]
    Engine(String),

    /// Pluggable transport helper failed.
    #[error("pluggable transport error: {0}")]
    Transport(String),

    /// Invalid configuration or bridge line.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Settings store failure.
    #[error("settings error: {0}")]
    Settings(String),

    /// Filesystem or socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The lifecycle manager task is no longer running.
    #[error("lifecycle manager is not running")]
    ManagerGone,
}

/// Result type alias using torkeeper's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The user-facing kind of this error, if it is one the embedding
    /// application is expected to present.
    pub fn kind(&self) -> Option<OnionErrorKind> {
        match self {
            Error::ConnectionDifficulty => Some(OnionErrorKind::ConnectionDifficulty),
            Error::InvalidBridges => Some(OnionErrorKind::InvalidBridges),
            Error::MissingCookieFile => Some(OnionErrorKind::MissingCookieFile),
            _ => None,
        }
    }
}

/// Lifecycle failures reported to the embedding application.
///
/// Each kind ends the current connection attempt only. The caller decides
/// whether to retry, typically after offering bridge configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnionErrorKind {
    /// Bootstrap stalled; a network pulse was sent.
    ConnectionDifficulty,
    /// Control cookie unreadable after the connect attempt.
    InvalidBridges,
    /// Cookie file not present.
    MissingCookieFile,
}

impl OnionErrorKind {
    /// Short title suitable for a dialog heading.
    pub fn title(&self) -> &'static str {
        "Tor connection error"
    }

    /// Human-readable explanation.
    pub fn description(&self) -> &'static str {
        match self {
            OnionErrorKind::ConnectionDifficulty => {
                "Connecting to Tor is taking longer than expected. \
                 If your network blocks Tor, try configuring bridges."
            }
            OnionErrorKind::InvalidBridges => {
                "Could not connect to Tor. Check your bridge configuration."
            }
            OnionErrorKind::MissingCookieFile => {
                "The Tor control cookie could not be found."
            }
        }
    }
}

impl fmt::Display for OnionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<OnionErrorKind> for Error {
    fn from(kind: OnionErrorKind) -> Self {
        match kind {
            OnionErrorKind::ConnectionDifficulty => Error::ConnectionDifficulty,
            OnionErrorKind::InvalidBridges => Error::InvalidBridges,
            OnionErrorKind::MissingCookieFile => Error::MissingCookieFile,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Settings(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_error() {
        for kind in [
            OnionErrorKind::ConnectionDifficulty,
            OnionErrorKind::InvalidBridges,
            OnionErrorKind::MissingCookieFile,
        ] {
            assert_eq!(Error::from(kind).kind(), Some(kind));
        }
    }

    #[test]
    fn test_plumbing_errors_have_no_kind() {
        assert_eq!(Error::Control("closed".into()).kind(), None);
        assert_eq!(Error::Timeout.kind(), None);
    }

    #[test]
    fn test_descriptions_are_distinct() {
        let a = OnionErrorKind::ConnectionDifficulty.description();
        let b = OnionErrorKind::InvalidBridges.description();
        let c = OnionErrorKind::MissingCookieFile.description();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(OnionErrorKind::InvalidBridges.title(), "Tor connection error");
    }
}
