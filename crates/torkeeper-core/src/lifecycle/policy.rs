//! Launch arguments and address-family policy.

use crate::config::ManagerConfig;
use crate::tor::ConfEntry;

const PREFER_IPV6_OR_PORT: &str = "ClientPreferIPv6ORPort";
const PREFER_IPV6_DIR_PORT: &str = "ClientPreferIPv6DirPort";
const USE_IPV4: &str = "ClientUseIPv4";

/// Address-family policy for the current network.
///
/// On an IPv6-only host Tor is told to prefer IPv6 OR ports. IPv4 stays
/// enabled when bridges are configured, since the bridge lines decide which
/// family is used; otherwise IPv4 is turned off.
pub fn ipv6_policy(ipv6_only: bool, bridges_configured: bool) -> Vec<ConfEntry> {
    if ipv6_only {
        vec![
            ConfEntry::new(PREFER_IPV6_OR_PORT, "1"),
            ConfEntry::new(USE_IPV4, if bridges_configured { "1" } else { "0" }),
        ]
    } else {
        vec![
            ConfEntry::new(PREFER_IPV6_OR_PORT, "auto"),
            ConfEntry::new(USE_IPV4, "1"),
        ]
    }
}

/// Policy pushed to a running Tor after a network change.
///
/// Same as [`ipv6_policy`], plus `ClientPreferIPv6DirPort=auto` when the
/// host is not IPv6-only.
pub fn network_change_delta(ipv6_only: bool, bridges_configured: bool) -> Vec<ConfEntry> {
    let mut delta = Vec::with_capacity(3);
    if !ipv6_only {
        delta.push(ConfEntry::new(PREFER_IPV6_DIR_PORT, "auto"));
    }
    delta.extend(ipv6_policy(ipv6_only, bridges_configured));
    delta
}

/// Base launch arguments derived from the configuration.
pub fn base_arguments(config: &ManagerConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(torrc) = config.torrc_path() {
        args.push("-f".to_string());
        args.push(torrc.display().to_string());
    }
    args.push("--ControlPort".to_string());
    args.push(config.control_addr.to_string());
    args.push("--CookieAuthentication".to_string());
    args.push("1".to_string());
    if let Some(data_dir) = &config.data_dir {
        args.push("--DataDirectory".to_string());
        args.push(data_dir.display().to_string());
    }
    args.push("--AvoidDiskWrites".to_string());
    args.push("1".to_string());
    args.push("--Log".to_string());
    args.push(if config.engine_logging {
        "notice stdout".to_string()
    } else {
        "notice file /dev/null".to_string()
    });
    args.push("--ClientUseIPv6".to_string());
    args.push("1".to_string());
    if let Some(auth_dir) = config.auth_dir() {
        args.push("--ClientOnionAuthDir".to_string());
        args.push(auth_dir.display().to_string());
    }
    args.push("--__OwningControllerProcess".to_string());
    args.push(std::process::id().to_string());
    args
}

/// Full launch argument list: base, bridges, then address-family policy.
pub fn startup_arguments(
    config: &ManagerConfig,
    bridge_arguments: Vec<String>,
    ipv6_only: bool,
    bridges_configured: bool,
) -> Vec<String> {
    let mut args = base_arguments(config);
    args.extend(bridge_arguments);
    for entry in ipv6_policy(ipv6_only, bridges_configured) {
        args.push(format!("--{}", entry.key));
        args.push(entry.value);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(entries: &'a [ConfEntry], key: &str) -> Option<&'a str> {
        entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    #[test]
    fn test_ipv6_only_with_bridges_keeps_ipv4() {
        let policy = ipv6_policy(true, true);
        assert_eq!(value(&policy, "ClientPreferIPv6ORPort"), Some("1"));
        assert_eq!(value(&policy, "ClientUseIPv4"), Some("1"));
    }

    #[test]
    fn test_ipv6_only_without_bridges_disables_ipv4() {
        let policy = ipv6_policy(true, false);
        assert_eq!(value(&policy, "ClientPreferIPv6ORPort"), Some("1"));
        assert_eq!(value(&policy, "ClientUseIPv4"), Some("0"));
    }

    #[test]
    fn test_dual_stack_is_auto() {
        let policy = ipv6_policy(false, false);
        assert_eq!(value(&policy, "ClientPreferIPv6ORPort"), Some("auto"));
        assert_eq!(value(&policy, "ClientUseIPv4"), Some("1"));
        assert_eq!(value(&policy, "ClientPreferIPv6DirPort"), None);

        let delta = network_change_delta(false, true);
        assert_eq!(value(&delta, "ClientPreferIPv6DirPort"), Some("auto"));
        assert_eq!(delta.len(), 3);
        assert_eq!(network_change_delta(true, false).len(), 2);
    }

    #[test]
    fn test_startup_arguments_order() {
        let config = ManagerConfig::with_data_dir("/tmp/torkeeper");
        let bridges = vec![
            "--Bridge".to_string(),
            "192.0.2.1:443".to_string(),
            "--UseBridges".to_string(),
            "1".to_string(),
        ];
        let args = startup_arguments(&config, bridges, true, true);

        assert_eq!(&args[..2], &["-f", "/tmp/torkeeper/torrc"]);
        let pos = |flag: &str| args.iter().position(|a| a == flag).expect(flag);
        assert_eq!(args[pos("--ControlPort") + 1], "127.0.0.1:39069");
        assert_eq!(args[pos("--DataDirectory") + 1], "/tmp/torkeeper");
        assert_eq!(args[pos("--ClientOnionAuthDir") + 1], "/tmp/torkeeper/auth");
        assert_eq!(args[pos("--Log") + 1], "notice file /dev/null");
        assert!(pos("--Bridge") < pos("--ClientPreferIPv6ORPort"));
        assert_eq!(args[pos("--ClientUseIPv4") + 1], "1");
        assert_eq!(args.last().map(String::as_str), Some("1"));
    }

    #[test]
    fn test_engine_logging_goes_to_stdout() {
        let mut config = ManagerConfig::with_data_dir("/tmp/torkeeper");
        config.engine_logging = true;
        let args = base_arguments(&config);
        let pos = args.iter().position(|a| a == "--Log").expect("--Log");
        assert_eq!(args[pos + 1], "notice stdout");
    }

    #[test]
    fn test_no_data_dir_omits_paths() {
        let args = base_arguments(&ManagerConfig::default());
        assert!(!args.iter().any(|a| a == "-f" || a == "--DataDirectory"));
        assert!(args.iter().any(|a| a == "--CookieAuthentication"));
    }
}
