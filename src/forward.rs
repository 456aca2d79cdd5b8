//! The forward register: origins currently delegated to upstream
//! resolvers instead of being answered from local data.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::RwLock;

use crate::codec::{self, DnsName};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardPolicy {
    /// Try the forwarders, fall back to normal resolution.
    First,
    /// Only ever ask the forwarders.
    Only,
    /// Forwarding disabled.
    #[default]
    None,
}

impl ForwardPolicy {
    pub fn parse(text: &str) -> Result<ForwardPolicy> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("first") {
            Ok(ForwardPolicy::First)
        } else if text.eq_ignore_ascii_case("only") {
            Ok(ForwardPolicy::Only)
        } else if text.eq_ignore_ascii_case("none") {
            Ok(ForwardPolicy::None)
        } else {
            Err(error!(UnexpectedToken => "'{}' is not a forward policy", text))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardZone {
    pub policy: ForwardPolicy,
    pub forwarders: Vec<IpAddr>,
}

/// Parses `idnsForwarders` values; a single invalid address poisons the
/// whole list so forwarding falls back to a safe default.
pub fn parse_forwarders(values: &[String]) -> Result<Vec<IpAddr>> {
    values
        .iter()
        .map(|value| {
            value
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| error!(UnexpectedToken => "'{}' is not a forwarder address", value))
        })
        .collect()
}

#[derive(Default)]
pub struct ForwardRegister {
    zones: RwLock<BTreeMap<DnsName, ForwardZone>>,
}

impl ForwardRegister {
    pub fn new() -> std::sync::Arc<ForwardRegister> {
        std::sync::Arc::new(ForwardRegister::default())
    }

    pub fn add(&self, origin: DnsName, zone: ForwardZone) {
        let mut zones = self.zones.write().expect("forward lock poisoned");
        log::info!(
            target: "zone_change",
            "forwarding {} ({:?}) via {:?}",
            codec::name_text(&origin),
            zone.policy,
            zone.forwarders
        );
        zones.insert(origin, zone);
    }

    pub fn delete(&self, origin: &DnsName) -> bool {
        let mut zones = self.zones.write().expect("forward lock poisoned");
        zones.remove(origin).is_some()
    }

    pub fn contains(&self, origin: &DnsName) -> bool {
        let zones = self.zones.read().expect("forward lock poisoned");
        zones.contains_key(origin)
    }

    pub fn get(&self, origin: &DnsName) -> Option<ForwardZone> {
        let zones = self.zones.read().expect("forward lock poisoned");
        zones.get(origin).cloned()
    }

    pub fn origins(&self) -> Vec<DnsName> {
        let zones = self.zones.read().expect("forward lock poisoned");
        zones.keys().cloned().collect()
    }
}
