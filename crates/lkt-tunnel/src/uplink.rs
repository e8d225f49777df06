//! VPN Uplink Detection
//!
//! The SSH backend only forwards through an already-established VPN.
//! An uplink counts as live when the interface table holds an interface
//! whose name contains one of the configured keywords.

use sysinfo::Networks;

/// "Is a VPN uplink live?"
pub trait UplinkProbe: Send + Sync {
    fn is_uplink_live(&self) -> bool;
}

/// Interface-table scan by name keyword
#[derive(Debug, Clone)]
pub struct InterfaceUplinkProbe {
    keywords: Vec<String>,
}

impl InterfaceUplinkProbe {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_ascii_lowercase()).collect(),
        }
    }

    pub(crate) fn matches(&self, interface: &str) -> bool {
        let name = interface.to_ascii_lowercase();
        self.keywords.iter().any(|k| !k.is_empty() && name.contains(k.as_str()))
    }
}

impl UplinkProbe for InterfaceUplinkProbe {
    fn is_uplink_live(&self) -> bool {
        interface_names().iter().any(|name| self.matches(name))
    }
}

/// Names of all network interfaces
pub fn interface_names() -> Vec<String> {
    Networks::new_with_refreshed_list()
        .list()
        .keys()
        .cloned()
        .collect()
}

/// Is there an interface with exactly this name (case-insensitive)?
pub fn interface_exists(name: &str) -> bool {
    interface_names()
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> InterfaceUplinkProbe {
        InterfaceUplinkProbe::new(&["tun".to_string(), "WG".to_string(), "ppp".to_string()])
    }

    #[test]
    fn test_keyword_matching() {
        let probe = probe();
        assert!(probe.matches("tun0"));
        assert!(probe.matches("wg-office"));
        assert!(probe.matches("PPP1"));
        assert!(!probe.matches("eth0"));
        assert!(!probe.matches("lo"));
    }

    #[test]
    fn test_empty_keyword_never_matches() {
        let probe = InterfaceUplinkProbe::new(&[String::new()]);
        assert!(!probe.matches("eth0"));
    }

    #[test]
    fn test_missing_interface() {
        assert!(!interface_exists("lkt-no-such-interface"));
    }
}
