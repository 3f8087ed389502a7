//! NIC network/bridge mapping.
//!
//! After the input plugin returns, the controller remaps every NIC
//! through the map built from `--network`, `--bridge` and `--mac`
//! arguments. Rules are tried in the order they were given; the first
//! applicable rule wins and the NIC keeps its pre-mapping name in
//! `vnet_orig` for later comment emission.

use std::sync::OnceLock;

use regex::Regex;

use crate::source::{Nic, VnetKind};
use crate::{Error, Result};

/// One mapping rule.
#[derive(Debug, Clone)]
enum Rule {
    /// `in:out` for a specific network/bridge name.
    Explicit {
        kind: VnetKind,
        from: String,
        to: String,
    },
    /// `mac:kind:out`, pinned to one NIC by MAC address.
    Mac {
        mac: String,
        kind: VnetKind,
        to: String,
    },
    /// `*:out` default for one kind.
    Default { kind: VnetKind, to: String },
}

/// Ordered set of NIC mapping rules.
#[derive(Debug, Clone, Default)]
pub struct NetworkMap {
    rules: Vec<Rule>,
}

/// Anchored MAC rule pattern: `HH:HH:HH:HH:HH:HH:{network|bridge}:out`.
fn mac_rule_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a literal
        Regex::new(
            r"^([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5}):(network|bridge):(.+)$",
        )
        .unwrap()
    })
}

impl NetworkMap {
    /// Creates an empty map (all NICs pass through unchanged).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `--network` rule: either `in:out` or a bare default `out`.
    pub fn add_network(&mut self, spec: &str) -> Result<()> {
        self.add_spec(VnetKind::Network, spec)
    }

    /// Adds a `--bridge` rule: either `in:out` or a bare default `out`.
    pub fn add_bridge(&mut self, spec: &str) -> Result<()> {
        self.add_spec(VnetKind::Bridge, spec)
    }

    fn add_spec(&mut self, kind: VnetKind, spec: &str) -> Result<()> {
        let rule = match spec.split_once(':') {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => Rule::Explicit {
                kind,
                from: from.to_owned(),
                to: to.to_owned(),
            },
            Some(_) => {
                return Err(Error::InvalidArgument(format!(
                    "cannot parse mapping rule '{spec}'"
                )));
            }
            None if !spec.is_empty() => Rule::Default {
                kind,
                to: spec.to_owned(),
            },
            None => {
                return Err(Error::InvalidArgument("empty mapping rule".into()));
            }
        };
        self.rules.push(rule);
        Ok(())
    }

    /// Adds a `--mac HH:HH:HH:HH:HH:HH:{network|bridge}:out` rule.
    pub fn add_mac(&mut self, spec: &str) -> Result<()> {
        let caps = mac_rule_re().captures(spec).ok_or_else(|| {
            Error::InvalidArgument(format!("cannot parse --mac '{spec}'"))
        })?;
        let kind = if &caps[2] == "network" {
            VnetKind::Network
        } else {
            VnetKind::Bridge
        };
        self.rules.push(Rule::Mac {
            mac: caps[1].to_ascii_lowercase(),
            kind,
            to: caps[3].to_owned(),
        });
        Ok(())
    }

    /// Remaps all NICs in place. NICs no rule matches are unchanged.
    pub fn apply(&self, nics: &mut [Nic]) {
        for nic in nics {
            for rule in &self.rules {
                match rule {
                    Rule::Mac { mac, kind, to } => {
                        if nic
                            .mac
                            .as_deref()
                            .is_some_and(|m| m.eq_ignore_ascii_case(mac))
                        {
                            nic.kind = *kind;
                            nic.vnet = to.clone();
                            break;
                        }
                    }
                    Rule::Explicit { kind, from, to } => {
                        if nic.kind == *kind && nic.vnet == *from {
                            nic.vnet = to.clone();
                            break;
                        }
                    }
                    Rule::Default { kind, to } => {
                        if nic.kind == *kind {
                            nic.vnet = to.clone();
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::NicModel;

    fn nic(mac: Option<&str>, vnet: &str, kind: VnetKind) -> Nic {
        Nic::new(
            mac.map(str::to_owned),
            Some(NicModel::E1000),
            vnet.to_owned(),
            kind,
        )
    }

    #[test]
    fn explicit_rule_matches_name_and_kind() {
        let mut map = NetworkMap::new();
        map.add_network("VM Network:default").unwrap();

        let mut nics = vec![
            nic(None, "VM Network", VnetKind::Network),
            nic(None, "VM Network", VnetKind::Bridge),
        ];
        map.apply(&mut nics);
        assert_eq!(nics[0].vnet, "default");
        assert_eq!(nics[0].vnet_orig, "VM Network");
        // Bridge NIC is untouched by a network rule.
        assert_eq!(nics[1].vnet, "VM Network");
    }

    #[test]
    fn first_applicable_rule_wins() {
        let mut map = NetworkMap::new();
        map.add_network("a:first").unwrap();
        map.add_network("a:second").unwrap();

        let mut nics = vec![nic(None, "a", VnetKind::Network)];
        map.apply(&mut nics);
        assert_eq!(nics[0].vnet, "first");
    }

    #[test]
    fn mac_rule_pins_kind_and_output() {
        let mut map = NetworkMap::new();
        map.add_mac("52:54:00:AA:bb:cc:bridge:br1").unwrap();

        let mut nics = vec![nic(Some("52:54:00:aa:BB:CC"), "whatever", VnetKind::Network)];
        map.apply(&mut nics);
        assert_eq!(nics[0].kind, VnetKind::Bridge);
        assert_eq!(nics[0].vnet, "br1");
    }

    #[test]
    fn default_rule_applies_per_kind() {
        let mut map = NetworkMap::new();
        map.add_bridge("br0").unwrap();

        let mut nics = vec![
            nic(None, "anything", VnetKind::Bridge),
            nic(None, "net0", VnetKind::Network),
        ];
        map.apply(&mut nics);
        assert_eq!(nics[0].vnet, "br0");
        assert_eq!(nics[1].vnet, "net0");
    }

    #[test]
    fn malformed_rules_are_rejected() {
        let mut map = NetworkMap::new();
        assert!(map.add_network(":out").is_err());
        assert!(map.add_network("in:").is_err());
        assert!(map.add_mac("not-a-mac:network:out").is_err());
        assert!(map.add_mac("52:54:00:00:00:01:nic:out").is_err());
    }
}
