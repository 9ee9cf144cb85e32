//! Control protocol reply and event parsing.
//!
//! Covers the subset torkeeper consumes: reply line framing,
//! `STATUS_CLIENT` events and `GETINFO circuit-status` entries.

use std::collections::HashMap;

/// Status code for asynchronous event notifications.
pub const EVENT_CODE: u16 = 650;

/// A single framed reply line: `250-key=value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    /// Three digit status code.
    pub code: u16,
    /// `' '` final line, `'-'` mid-reply line, `'+'` data follows.
    pub separator: char,
    /// Text after the separator.
    pub text: &'a str,
}

impl<'a> ReplyLine<'a> {
    /// Parse one line, without the trailing CRLF.
    pub fn parse(line: &'a str) -> Option<Self> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return None;
        }
        let code = line[..3].parse::<u16>().ok()?;
        let mut rest = line[3..].chars();
        let separator = rest.next().unwrap_or(' ');
        if !matches!(separator, ' ' | '-' | '+') {
            return None;
        }
        let text = if line.len() > 4 { &line[4..] } else { "" };
        Some(Self {
            code,
            separator,
            text,
        })
    }

    /// Last line of a reply.
    pub fn is_final(&self) -> bool {
        self.separator == ' '
    }

    /// A data block follows, terminated by a lone `.`.
    pub fn has_data(&self) -> bool {
        self.separator == '+'
    }
}

/// A complete synchronous reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status code of the final line.
    pub code: u16,
    /// Text of every line, data block lines included.
    pub lines: Vec<String>,
}

impl Reply {
    /// 2xx reply.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Value of `key=value` in any line of the reply.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// A parsed `STATUS_GENERAL` / `STATUS_CLIENT` / `STATUS_SERVER` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Event type, e.g. `STATUS_CLIENT`.
    pub kind: String,
    /// `NOTICE`, `WARN` or `ERR`.
    pub severity: String,
    /// Action keyword, e.g. `BOOTSTRAP`.
    pub action: String,
    /// Keyword arguments with quotes removed.
    pub arguments: HashMap<String, String>,
}

impl StatusEvent {
    /// Parse the text of a `650` line. Returns `None` for other events.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = tokenize(text).into_iter();
        let kind = tokens.next()?;
        if !kind.starts_with("STATUS_") {
            return None;
        }
        let severity = tokens.next()?;
        let action = tokens.next()?;
        let arguments = tokens
            .filter_map(|token| {
                token
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Some(Self {
            kind,
            severity,
            action,
            arguments,
        })
    }

    /// Bootstrap percentage, for `STATUS_CLIENT BOOTSTRAP` events.
    pub fn bootstrap_progress(&self) -> Option<u8> {
        if self.kind != "STATUS_CLIENT" || self.action != "BOOTSTRAP" {
            return None;
        }
        self.arguments
            .get("PROGRESS")
            .and_then(|p| p.parse::<u8>().ok())
            .map(|p| p.min(100))
    }

    /// Whether this reports a newly established circuit.
    pub fn is_circuit_established(&self) -> bool {
        self.kind == "STATUS_CLIENT" && self.action == "CIRCUIT_ESTABLISHED"
    }
}

/// A relay hop of a circuit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitHop {
    /// Hex fingerprint without the leading `$`.
    pub fingerprint: String,
    /// Relay nickname, when Tor reports one.
    pub nickname: Option<String>,
}

/// An entry of `GETINFO circuit-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// Circuit identifier.
    pub id: String,
    /// `LAUNCHED`, `BUILT`, `EXTENDED`, `FAILED` or `CLOSED`.
    pub status: String,
    /// Hops from guard to exit.
    pub path: Vec<CircuitHop>,
    /// `BUILD_FLAGS` values.
    pub build_flags: Vec<String>,
    /// `PURPOSE` value.
    pub purpose: Option<String>,
}

impl Circuit {
    /// Parse one circuit-status line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let id = tokens.next()?.to_string();
        let status = tokens.next()?.to_string();
        let mut circuit = Circuit {
            id,
            status,
            path: Vec::new(),
            build_flags: Vec::new(),
            purpose: None,
        };
        for token in tokens {
            match token.split_once('=') {
                Some(("BUILD_FLAGS", flags)) => {
                    circuit.build_flags = flags.split(',').map(String::from).collect();
                }
                Some(("PURPOSE", purpose)) => circuit.purpose = Some(purpose.to_string()),
                Some(_) => {}
                None if circuit.path.is_empty() => {
                    circuit.path = token.split(',').map(parse_hop).collect();
                }
                None => {}
            }
        }
        Some(circuit)
    }

    /// Fully built circuit.
    pub fn is_built(&self) -> bool {
        self.status == "BUILT"
    }
}

fn parse_hop(hop: &str) -> CircuitHop {
    let hop = hop.trim_start_matches('$');
    match hop.split_once(['~', '=']) {
        Some((fingerprint, nickname)) => CircuitHop {
            fingerprint: fingerprint.to_string(),
            nickname: Some(nickname.to_string()),
        },
        None => CircuitHop {
            fingerprint: hop.to_string(),
            nickname: None,
        },
    }
}

/// Parse the body of a `circuit-status` data block.
pub fn parse_circuit_status(lines: &[String]) -> Vec<Circuit> {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| Circuit::parse(line))
        .collect()
}

/// Split on spaces, keeping `"quoted strings"` whole and unescaping them.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
