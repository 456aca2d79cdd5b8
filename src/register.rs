//! The zone register: every zone the instance serves as a master, keyed by
//! origin, with its database handles, owning DN, per-zone settings and
//! serialization task.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::codec::{self, DnsName};
use crate::error::Result;
use crate::settings::SettingsSet;
use crate::task::Task;
use crate::zone::ZoneDb;

/// Everything the engine keeps per served zone. The register owns only
/// handles; per-zone tasks find their zone back by origin, never by
/// pointer.
#[derive(Clone, Debug)]
pub struct ZoneInfo {
    pub origin: DnsName,
    pub dn: String,
    pub db: Arc<ZoneDb>,
    /// Secure database for inline signing; absent unless the host set one
    /// up.
    pub secure_db: Option<Arc<ZoneDb>>,
    pub settings: Arc<SettingsSet>,
    pub task: Task,
}

#[derive(Default)]
pub struct ZoneRegister {
    zones: RwLock<BTreeMap<DnsName, Arc<ZoneInfo>>>,
}

impl ZoneRegister {
    pub fn new() -> Arc<ZoneRegister> {
        Arc::new(ZoneRegister::default())
    }

    pub fn add(&self, info: ZoneInfo) -> Result<Arc<ZoneInfo>> {
        let mut zones = self.zones.write().expect("register lock poisoned");
        if zones.contains_key(&info.origin) {
            return Err(
                error!(Exists => "zone {} is already registered", codec::name_text(&info.origin)),
            );
        }
        let info = Arc::new(info);
        zones.insert(info.origin.clone(), info.clone());
        Ok(info)
    }

    pub fn delete(&self, origin: &DnsName) -> Result<Arc<ZoneInfo>> {
        let mut zones = self.zones.write().expect("register lock poisoned");
        zones.remove(origin).ok_or_else(
            || error!(NotFound => "zone {} is not registered", codec::name_text(origin)),
        )
    }

    /// Exact-origin lookup.
    pub fn get(&self, origin: &DnsName) -> Option<Arc<ZoneInfo>> {
        let zones = self.zones.read().expect("register lock poisoned");
        zones.get(origin).cloned()
    }

    /// Deepest registered zone enclosing `name`, if any.
    pub fn find(&self, name: &DnsName) -> Option<Arc<ZoneInfo>> {
        let zones = self.zones.read().expect("register lock poisoned");
        let mut walk = name.clone();
        loop {
            if let Some(info) = zones.get(&walk) {
                return Some(info.clone());
            }
            match walk.parent() {
                Some(parent) => walk = parent,
                None => return None,
            }
        }
    }

    /// DN of the entry holding `name`, built from the enclosing zone.
    pub fn dn_for_name(&self, name: &DnsName) -> Result<String> {
        let info = self.find(name).ok_or_else(
            || error!(NotFound => "no registered zone contains {}", codec::name_text(name)),
        )?;
        codec::name_to_dn(name, &info.origin, &info.dn)
    }

    pub fn settings(&self, origin: &DnsName) -> Option<Arc<SettingsSet>> {
        self.get(origin).map(|info| info.settings.clone())
    }

    /// Snapshot of the registered origins. Iteration works on names, not
    /// nodes, so zones removed mid-walk are simply skipped by the caller's
    /// next `get`.
    pub fn origins(&self) -> Vec<DnsName> {
        let zones = self.zones.read().expect("register lock poisoned");
        zones.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let zones = self.zones.read().expect("register lock poisoned");
        zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
