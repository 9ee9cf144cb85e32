//! Bridge configuration.
//!
//! Turns the user's bridge choice into the two shapes Tor accepts: command
//! line arguments at launch, and `SETCONF` entries for a running instance.

use crate::error::{Error, Result};
use crate::tor::ConfEntry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Conf key for bridge lines.
pub const BRIDGE_KEY: &str = "Bridge";

/// Conf key toggling bridge use.
pub const USE_BRIDGES_KEY: &str = "UseBridges";

/// Which bridges to connect through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgesType {
    /// Direct connection.
    #[default]
    None,
    /// Bridges shipped with the application.
    #[serde(rename = "builtin")]
    BuiltIn,
    /// Bridges supplied by the user.
    Custom,
}

/// Snapshot of the active bridge choice.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgeConfiguration {
    /// Selected strategy.
    pub bridges_type: BridgesType,
    /// User bridge lines; only consulted for [`BridgesType::Custom`].
    pub custom_bridges: Option<Vec<String>>,
}

impl BridgeConfiguration {
    /// Create a configuration.
    pub fn new(bridges_type: BridgesType, custom_bridges: Option<Vec<String>>) -> Self {
        Self {
            bridges_type,
            custom_bridges,
        }
    }

    /// Whether switching from `self` to `next` requires pushing new bridge
    /// settings to a running Tor.
    ///
    /// True iff the type differs, the custom lists differ element-wise, or
    /// exactly one of the lists is absent.
    pub fn needs_reconfiguration(&self, next: &BridgeConfiguration) -> bool {
        self.bridges_type != next.bridges_type || self.custom_bridges != next.custom_bridges
    }

    /// Whether any bridge strategy is selected at all.
    pub fn uses_bridges(&self) -> bool {
        self.bridges_type != BridgesType::None
    }
}

/// Resolves a [`BridgeConfiguration`] into concrete bridge lines.
#[derive(Debug, Clone, Copy)]
pub struct BridgeResolver<'a> {
    configuration: &'a BridgeConfiguration,
    builtin: &'a [String],
}

impl<'a> BridgeResolver<'a> {
    /// Resolver over `configuration`, using `builtin` for the built-in type.
    pub fn new(configuration: &'a BridgeConfiguration, builtin: &'a [String]) -> Self {
        Self {
            configuration,
            builtin,
        }
    }

    /// Bridge lines currently in effect.
    pub fn bridge_lines(&self) -> &'a [String] {
        match self.configuration.bridges_type {
            BridgesType::Custom => self.configuration.custom_bridges.as_deref().unwrap_or(&[]),
            BridgesType::BuiltIn => self.builtin,
            BridgesType::None => &[],
        }
    }

    /// Launch arguments: `--Bridge <line>` per line, then `--UseBridges 1`.
    pub fn as_arguments(&self) -> Vec<String> {
        let mut args = Vec::new();
        for line in self.bridge_lines() {
            args.push("--Bridge".to_string());
            args.push(line.clone());
        }
        if !args.is_empty() {
            args.push("--UseBridges".to_string());
            args.push("1".to_string());
        }
        args
    }

    /// Bridge lines as `SETCONF` entries, each value double-quoted.
    pub fn as_config_delta(&self) -> Vec<ConfEntry> {
        self.bridge_lines()
            .iter()
            .map(|line| ConfEntry::new(BRIDGE_KEY, quote(line)))
            .collect()
    }

    /// Ordered steps that move a running Tor onto the current bridges.
    ///
    /// `UseBridges` is only switched on after the new list is in place, and
    /// switched off before the list is cleared.
    pub fn reconfiguration_steps(&self) -> Vec<ConfStep> {
        let delta = self.as_config_delta();
        if delta.is_empty() {
            vec![
                ConfStep::SetConf(ConfEntry::new(USE_BRIDGES_KEY, "0")),
                ConfStep::ResetConf(BRIDGE_KEY.to_string()),
            ]
        } else {
            vec![
                ConfStep::ResetConf(BRIDGE_KEY.to_string()),
                ConfStep::SetConfs(delta),
                ConfStep::SetConf(ConfEntry::new(USE_BRIDGES_KEY, "1")),
            ]
        }
    }
}

/// One configuration push against a running Tor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfStep {
    /// `RESETCONF key`
    ResetConf(String),
    /// `SETCONF` with several entries in one command.
    SetConfs(Vec<ConfEntry>),
    /// `SETCONF key=value`
    SetConf(ConfEntry),
}

/// Check that a user-supplied bridge line is usable.
///
/// Accepts `[transport] addr:port [fingerprint] [k=v ...]` where the address
/// is an IP literal, as Tor requires.
pub fn validate_bridge_line(line: &str) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Config("empty bridge line".into()));
    }
    if line.contains(['\n', '\r', '"']) {
        return Err(Error::Config("bridge line contains forbidden characters".into()));
    }
    let has_address = line
        .split_whitespace()
        .take(2)
        .any(|field| field.parse::<SocketAddr>().is_ok());
    if !has_address {
        return Err(Error::Config("bridge line has no address".into()));
    }
    Ok(())
}

fn quote(line: &str) -> String {
    format!("\"{}\"", line.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(lines: &[&str]) -> BridgeConfiguration {
        BridgeConfiguration::new(
            BridgesType::Custom,
            Some(lines.iter().map(|s| s.to_string()).collect()),
        )
    }

    #[test]
    fn test_needs_reconfiguration_on_type_change() {
        let old = BridgeConfiguration::default();
        let new = BridgeConfiguration::new(BridgesType::BuiltIn, None);
        assert!(old.needs_reconfiguration(&new));
    }

    #[test]
    fn test_needs_reconfiguration_on_list_change() {
        let old = custom(&["1.2.3.4:443"]);
        assert!(old.needs_reconfiguration(&custom(&["1.2.3.4:444"])));
        assert!(old.needs_reconfiguration(&custom(&["1.2.3.4:443", "5.6.7.8:80"])));
        assert!(!old.needs_reconfiguration(&custom(&["1.2.3.4:443"])));
    }

    #[test]
    fn test_needs_reconfiguration_on_presence_mismatch() {
        let with_list = custom(&[]);
        let without = BridgeConfiguration::new(BridgesType::Custom, None);
        assert!(with_list.needs_reconfiguration(&without));
        assert!(without.needs_reconfiguration(&with_list));
        assert!(!without.needs_reconfiguration(&without.clone()));
    }

    #[test]
    fn test_arguments_empty_without_bridges() {
        let config = BridgeConfiguration::default();
        assert!(BridgeResolver::new(&config, &[]).as_arguments().is_empty());

        // Custom type with no list is direct as well.
        let config = BridgeConfiguration::new(BridgesType::Custom, None);
        assert!(BridgeResolver::new(&config, &[]).as_arguments().is_empty());
    }

    #[test]
    fn test_arguments_with_bridges() {
        let config = custom(&["obfs4 1.2.3.4:443 AAAA cert=x", "5.6.7.8:9001"]);
        let args = BridgeResolver::new(&config, &[]).as_arguments();
        assert_eq!(
            args,
            vec![
                "--Bridge",
                "obfs4 1.2.3.4:443 AAAA cert=x",
                "--Bridge",
                "5.6.7.8:9001",
                "--UseBridges",
                "1"
            ]
        );
    }

    #[test]
    fn test_builtin_uses_configured_list() {
        let builtin = vec!["obfs4 9.9.9.9:443 BBBB cert=y".to_string()];
        let config = BridgeConfiguration::new(BridgesType::BuiltIn, Some(vec!["ignored".into()]));
        let resolver = BridgeResolver::new(&config, &builtin);
        assert_eq!(resolver.bridge_lines(), builtin.as_slice());
    }

    #[test]
    fn test_config_delta_is_quoted_and_idempotent() {
        let config = custom(&["bridge1 1.2.3.4:443"]);
        let resolver = BridgeResolver::new(&config, &[]);
        let first = resolver.as_config_delta();
        assert_eq!(first, vec![ConfEntry::new("Bridge", "\"bridge1 1.2.3.4:443\"")]);
        assert_eq!(first, resolver.as_config_delta());
    }

    #[test]
    fn test_reconfiguration_steps_enable() {
        let config = custom(&["1.2.3.4:443"]);
        let steps = BridgeResolver::new(&config, &[]).reconfiguration_steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], ConfStep::ResetConf("Bridge".into()));
        assert!(matches!(steps[1], ConfStep::SetConfs(ref e) if e.len() == 1));
        assert_eq!(steps[2], ConfStep::SetConf(ConfEntry::new("UseBridges", "1")));
    }

    #[test]
    fn test_reconfiguration_steps_disable() {
        let config = BridgeConfiguration::default();
        let steps = BridgeResolver::new(&config, &[]).reconfiguration_steps();
        assert_eq!(
            steps,
            vec![
                ConfStep::SetConf(ConfEntry::new("UseBridges", "0")),
                ConfStep::ResetConf("Bridge".into()),
            ]
        );
    }

    #[test]
    fn test_validate_bridge_line() {
        assert!(validate_bridge_line("obfs4 192.0.2.1:443 FP cert=abc iat-mode=0").is_ok());
        assert!(validate_bridge_line("192.0.2.1:9001 FP").is_ok());
        assert!(validate_bridge_line("[2001:db8::1]:443").is_ok());
        assert!(validate_bridge_line("").is_err());
        assert!(validate_bridge_line("obfs4 example.com:443").is_err());
        assert!(validate_bridge_line("1.2.3.4:443\nUseBridges 0").is_err());
    }

    #[test]
    fn test_serde_shape() {
        let config = custom(&["1.2.3.4:443"]);
        let json = serde_json::to_string(&config).expect("serialize");
        assert_eq!(json, r#"{"bridges_type":"custom","custom_bridges":["1.2.3.4:443"]}"#);
        let builtin: BridgesType = serde_json::from_str("\"builtin\"").expect("deserialize");
        assert_eq!(builtin, BridgesType::BuiltIn);
    }
}
