//! In-memory zone databases and the view of published zones.
//!
//! A [`ZoneDb`] holds the rrsets of one zone. Mutations happen through a
//! [`VersionTxn`]: a copy-on-write version that becomes visible only when
//! committed, so readers always see a consistent zone.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::name::{FlattenInto, Name};
use domain::base::{Record, RecordData, Serial, Ttl};
use domain::rdata::{Soa, ZoneRecordData};
use domain::zonefile::inplace::{Entry as FileEntry, Zonefile};

use crate::codec::{name_text, DnsName};
use crate::error::Result;

pub type Rdata = ZoneRecordData<Bytes, Name<Bytes>>;

/// All records at one `(owner, type)`; the class is always `IN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrset {
    pub rtype: Rtype,
    pub ttl: Ttl,
    pub data: Vec<Rdata>,
}

impl Rrset {
    pub fn new(rtype: Rtype, ttl: Ttl) -> Rrset {
        Rrset {
            rtype,
            ttl,
            data: Vec::new(),
        }
    }
}

type NodeMap = BTreeMap<DnsName, BTreeMap<Rtype, Rrset>>;

/// One zone's authoritative data.
#[derive(Debug)]
pub struct ZoneDb {
    apex: DnsName,
    class: Class,
    nodes: RwLock<Arc<NodeMap>>,
}

impl ZoneDb {
    pub fn new(apex: DnsName, class: Class) -> Arc<ZoneDb> {
        Arc::new(ZoneDb {
            apex,
            class,
            nodes: RwLock::new(Arc::new(NodeMap::new())),
        })
    }

    pub fn apex(&self) -> &DnsName {
        &self.apex
    }

    pub fn class(&self) -> Class {
        self.class
    }

    /// A consistent snapshot of the current version.
    pub fn read(&self) -> Snapshot {
        let nodes = self.nodes.read().expect("zone lock poisoned");
        Snapshot {
            nodes: nodes.clone(),
        }
    }

    /// Opens a fresh writable version seeded with the current contents.
    pub fn new_version(&self) -> VersionTxn<'_> {
        let nodes = self.nodes.read().expect("zone lock poisoned");
        VersionTxn {
            db: self,
            nodes: (**nodes).clone(),
        }
    }
}

/// Read-only view of one committed version.
#[derive(Clone)]
pub struct Snapshot {
    nodes: Arc<NodeMap>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn rrsets_at(&self, name: &DnsName) -> Vec<Rrset> {
        self.nodes
            .get(name)
            .map(|sets| sets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rrset(&self, name: &DnsName, rtype: Rtype) -> Option<Rrset> {
        self.nodes.get(name).and_then(|sets| sets.get(&rtype)).cloned()
    }

    /// Every rrset in the zone, owners in canonical order.
    pub fn all(&self) -> impl Iterator<Item = (&DnsName, &Rrset)> {
        self.nodes
            .iter()
            .flat_map(|(name, sets)| sets.values().map(move |set| (name, set)))
    }

    pub fn soa(&self, apex: &DnsName) -> Option<(Ttl, Soa<DnsName>)> {
        let rrset = self.rrset(apex, Rtype::SOA)?;
        let soa = rrset.data.first().and_then(|data| match data {
            ZoneRecordData::Soa(soa) => Some(soa.clone()),
            _ => None,
        })?;
        Some((rrset.ttl, soa))
    }

    pub fn soa_serial(&self, apex: &DnsName) -> Option<Serial> {
        self.soa(apex).map(|(_, soa)| soa.serial())
    }
}

/// A writable version; nothing is visible until [`VersionTxn::commit`].
pub struct VersionTxn<'a> {
    db: &'a ZoneDb,
    nodes: NodeMap,
}

impl VersionTxn<'_> {
    pub fn add(&mut self, name: &DnsName, ttl: Ttl, rdata: Rdata) {
        let sets = self.nodes.entry(name.clone()).or_default();
        let rrset = sets
            .entry(rdata.rtype())
            .or_insert_with(|| Rrset::new(rdata.rtype(), ttl));
        rrset.ttl = ttl;
        if !rrset.data.contains(&rdata) {
            rrset.data.push(rdata);
        }
    }

    pub fn del(&mut self, name: &DnsName, rdata: &Rdata) -> Result<()> {
        let sets = self.nodes.get_mut(name).ok_or_else(
            || error!(NotFound => "no node {} in zone {}", name_text(name), self.db.apex),
        )?;
        let rrset = sets.get_mut(&rdata.rtype()).ok_or_else(|| {
            error!(NotFound => "no {} rrset at {}", rdata.rtype(), name_text(name))
        })?;
        let index = rrset.data.iter().position(|d| d == rdata).ok_or_else(|| {
            error!(NotFound => "no matching {} record at {}", rdata.rtype(), name_text(name))
        })?;
        rrset.data.remove(index);
        if rrset.data.is_empty() {
            sets.remove(&rdata.rtype());
        }
        if sets.is_empty() {
            self.nodes.remove(name);
        }
        Ok(())
    }

    /// Publishes the version.
    pub fn commit(self) {
        let mut nodes = self.db.nodes.write().expect("zone lock poisoned");
        *nodes = Arc::new(self.nodes);
    }
}

/// Parses one rdata value given in master-file text form. Names inside
/// the value without a trailing dot are taken as absolute anyway; that is
/// how the write-back path renders them.
pub fn parse_rdata(owner: &DnsName, ttl: Ttl, rtype: Rtype, text: &str) -> Result<Rdata> {
    let line = format!("{} {} IN {} {}\n", name_text(owner), ttl.as_secs(), rtype, text);

    let mut reader = Zonefile::new();
    reader.set_origin(Name::root_bytes());
    reader.extend_from_slice(line.as_bytes());

    let entry = reader
        .next_entry()
        .map_err(|e| error!(ZoneFormat => "cannot parse '{}' as {} data: {}", text, rtype, e))?
        .ok_or_else(|| error!(ZoneFormat => "empty {} value '{}'", rtype, text))?;

    match entry {
        FileEntry::Record(record) => {
            let record: Record<DnsName, Rdata> = record.flatten_into();
            if record.rtype() != rtype {
                return Err(
                    error!(ZoneFormat => "'{}' parsed as {} instead of {}", text, record.rtype(), rtype),
                );
            }
            Ok(record.into_data())
        }
        _ => Err(error!(ZoneFormat => "'{}' is not a record", text)),
    }
}

/// Publication state of a zone inside the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    Created,
    Published,
    Loaded,
    Active,
}

#[derive(Clone)]
struct PublishedZone {
    db: Arc<ZoneDb>,
    state: LoadState,
    /// Host-provided empty zones that may be shadowed by real ones.
    builtin: bool,
}

/// The zones currently visible to the query path of the host name-server.
#[derive(Default)]
pub struct ZoneView {
    zones: RwLock<BTreeMap<DnsName, PublishedZone>>,
    cache_flushes: AtomicU64,
}

impl ZoneView {
    pub fn new() -> Arc<ZoneView> {
        Arc::new(ZoneView::default())
    }

    pub fn publish(&self, db: Arc<ZoneDb>) -> Result<()> {
        let mut zones = self.zones.write().expect("view lock poisoned");
        let apex = db.apex().clone();
        if let Some(existing) = zones.get(&apex) {
            if !existing.builtin {
                return Err(error!(Exists => "zone {} is already published", name_text(&apex)));
            }
        }
        log::info!(target: "zone_change", "adding zone {}", name_text(&apex));
        zones.insert(
            apex,
            PublishedZone {
                db,
                state: LoadState::Published,
                builtin: false,
            },
        );
        Ok(())
    }

    /// Installs a host builtin (an empty zone that real data may replace).
    pub fn publish_builtin(&self, db: Arc<ZoneDb>) {
        let mut zones = self.zones.write().expect("view lock poisoned");
        zones.entry(db.apex().clone()).or_insert(PublishedZone {
            db,
            state: LoadState::Published,
            builtin: true,
        });
    }

    pub fn unload(&self, apex: &DnsName) -> Result<()> {
        let mut zones = self.zones.write().expect("view lock poisoned");
        log::info!(target: "zone_change", "removing zone {}", name_text(apex));
        zones
            .remove(apex)
            .map(|_| ())
            .ok_or_else(|| error!(NotFound => "zone {} is not published", name_text(apex)))
    }

    pub fn contains(&self, apex: &DnsName) -> bool {
        let zones = self.zones.read().expect("view lock poisoned");
        zones.contains_key(apex)
    }

    pub fn is_builtin(&self, apex: &DnsName) -> bool {
        let zones = self.zones.read().expect("view lock poisoned");
        zones.get(apex).map(|z| z.builtin).unwrap_or(false)
    }

    pub fn state(&self, apex: &DnsName) -> Option<LoadState> {
        let zones = self.zones.read().expect("view lock poisoned");
        zones.get(apex).map(|z| z.state)
    }

    pub fn set_state(&self, apex: &DnsName, state: LoadState) -> Result<()> {
        let mut zones = self.zones.write().expect("view lock poisoned");
        let zone = zones
            .get_mut(apex)
            .ok_or_else(|| error!(NotFound => "zone {} is not published", name_text(apex)))?;
        zone.state = state;
        Ok(())
    }

    pub fn db(&self, apex: &DnsName) -> Option<Arc<ZoneDb>> {
        let zones = self.zones.read().expect("view lock poisoned");
        zones.get(apex).map(|z| z.db.clone())
    }

    /// Drops cached answers after the zone set changed shape.
    pub fn flush_cache(&self) {
        self.cache_flushes.fetch_add(1, Ordering::Relaxed);
        log::debug!(target: "zone_change", "view cache flushed");
    }

    pub fn cache_flushes(&self) -> u64 {
        self.cache_flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> DnsName {
        DnsName::bytes_from_str(text).unwrap()
    }

    #[test]
    fn version_commit_is_atomic() {
        let db = ZoneDb::new(name("example.org."), Class::IN);
        let owner = name("host.example.org.");
        let rdata = parse_rdata(&owner, Ttl::from_secs(300), Rtype::A, "192.0.2.1").unwrap();

        let mut txn = db.new_version();
        txn.add(&owner, Ttl::from_secs(300), rdata.clone());
        // not yet visible
        assert!(db.read().rrsets_at(&owner).is_empty());
        txn.commit();

        let sets = db.read().rrsets_at(&owner);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].data, vec![rdata]);
    }

    #[test]
    fn delete_prunes_empty_nodes() {
        let db = ZoneDb::new(name("example.org."), Class::IN);
        let owner = name("host.example.org.");
        let rdata = parse_rdata(&owner, Ttl::from_secs(300), Rtype::A, "192.0.2.1").unwrap();

        let mut txn = db.new_version();
        txn.add(&owner, Ttl::from_secs(300), rdata.clone());
        txn.commit();

        let mut txn = db.new_version();
        txn.del(&owner, &rdata).unwrap();
        txn.commit();
        assert!(db.read().is_empty());
    }

    #[test]
    fn deleting_missing_data_fails() {
        let db = ZoneDb::new(name("example.org."), Class::IN);
        let owner = name("host.example.org.");
        let rdata = parse_rdata(&owner, Ttl::from_secs(300), Rtype::A, "192.0.2.1").unwrap();

        let mut txn = db.new_version();
        assert!(txn.del(&owner, &rdata).is_err());
    }

    #[test]
    fn soa_lookup() {
        let apex = name("example.org.");
        let db = ZoneDb::new(apex.clone(), Class::IN);
        let soa = parse_rdata(
            &apex,
            Ttl::from_secs(3600),
            Rtype::SOA,
            "ns.example.org. root.example.org. 7 3600 900 1209600 3600",
        )
        .unwrap();

        let mut txn = db.new_version();
        txn.add(&apex, Ttl::from_secs(3600), soa);
        txn.commit();

        assert_eq!(db.read().soa_serial(&apex), Some(Serial::from(7)));
    }

    #[test]
    fn parse_rejects_mismatched_type() {
        let owner = name("host.example.org.");
        assert!(parse_rdata(&owner, Ttl::from_secs(300), Rtype::A, "not-an-address").is_err());
    }

    #[test]
    fn view_publish_and_builtin_shadowing() {
        let view = ZoneView::new();
        let apex = name("example.org.");

        view.publish_builtin(ZoneDb::new(apex.clone(), Class::IN));
        assert!(view.is_builtin(&apex));

        // a builtin never blocks the real zone
        view.unload(&apex).unwrap();
        view.publish(ZoneDb::new(apex.clone(), Class::IN)).unwrap();
        assert!(!view.is_builtin(&apex));
        assert!(view.publish(ZoneDb::new(apex.clone(), Class::IN)).is_err());
    }
}
