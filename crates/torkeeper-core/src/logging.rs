//! Logging helpers.
//!
//! Bridge lines and control cookies must never reach the logs verbatim:
//! a bridge line identifies the entry the user is hiding, and the cookie
//! grants full control over Tor. The wrappers here redact them when
//! formatted. Tor's own log output is re-emitted through `tracing` by
//! [`forward_engine_line`].

use std::fmt;

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a bridge line, keeping only the transport name.
///
/// `obfs4 192.0.2.1:443 FINGERPRINT cert=...` is shown as `obfs4 [REDACTED]`,
/// a vanilla bridge `192.0.2.1:443 FINGERPRINT` as `[REDACTED]`.
pub struct RedactedBridge<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedBridge<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_whitespace().next() {
            Some(first) if !first.contains(':') && !first.contains('.') => {
                write!(f, "{} [REDACTED]", first)
            }
            _ => write!(f, "[REDACTED]"),
        }
    }
}

impl<'a> fmt::Debug for RedactedBridge<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Severity of a Tor log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLogLevel {
    /// `[debug]`
    Debug,
    /// `[info]`
    Info,
    /// `[notice]`
    Notice,
    /// `[warn]`
    Warn,
    /// `[err]`
    Error,
}

impl fmt::Display for EngineLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineLogLevel::Debug => write!(f, "debug"),
            EngineLogLevel::Info => write!(f, "info"),
            EngineLogLevel::Notice => write!(f, "notice"),
            EngineLogLevel::Warn => write!(f, "warn"),
            EngineLogLevel::Error => write!(f, "err"),
        }
    }
}

/// Split a Tor log line into its severity and message.
///
/// Tor writes `Oct 19 12:00:00.000 [notice] Bootstrapped 5% ...`. Lines
/// without a recognised severity tag are treated as notices.
pub fn parse_engine_line(line: &str) -> (EngineLogLevel, &str) {
    let tags = [
        ("[debug] ", EngineLogLevel::Debug),
        ("[info] ", EngineLogLevel::Info),
        ("[notice] ", EngineLogLevel::Notice),
        ("[warn] ", EngineLogLevel::Warn),
        ("[err] ", EngineLogLevel::Error),
    ];
    for (tag, level) in tags {
        if let Some(pos) = line.find(tag) {
            return (level, line[pos + tag.len()..].trim_end());
        }
    }
    (EngineLogLevel::Notice, line.trim_end())
}

/// Re-emit one line of Tor output through `tracing`.
pub fn forward_engine_line(line: &str) {
    let (level, message) = parse_engine_line(line);
    match level {
        EngineLogLevel::Debug => tracing::debug!(target: "tor", "{}", message),
        EngineLogLevel::Info => tracing::info!(target: "tor", "{}", message),
        EngineLogLevel::Notice => tracing::info!(target: "tor", severity = "notice", "{}", message),
        EngineLogLevel::Warn => tracing::warn!(target: "tor", "{}", message),
        EngineLogLevel::Error => tracing::error!(target: "tor", "{}", message),
    }
}
