//! In-memory form of a directory entry and the attribute conventions the
//! schema encodes: `objectClass` membership, `<RRTYPE>Record` attributes,
//! `dnsTTL`, and the seven-piece SOA.

use std::fmt;

use domain::base::iana::{Class, Rtype};
use domain::base::Ttl;

use crate::codec::{self, DnsName, DnTarget};
use crate::error::Result;
use crate::ldap::{ChangeType, RawEntry};

pub const ATTR_OBJECT_CLASS: &str = "objectClass";
pub const ATTR_TTL: &str = "dnsTTL";
pub const ATTR_SOA_MNAME: &str = "idnsSOAmName";
pub const ATTR_SOA_RNAME: &str = "idnsSOArName";
pub const ATTR_SOA_SERIAL: &str = "idnsSOAserial";
pub const ATTR_SOA_REFRESH: &str = "idnsSOArefresh";
pub const ATTR_SOA_RETRY: &str = "idnsSOAretry";
pub const ATTR_SOA_EXPIRE: &str = "idnsSOAexpire";
pub const ATTR_SOA_MINIMUM: &str = "idnsSOAminimum";
pub const ATTR_ZONE_ACTIVE: &str = "idnsZoneActive";

const DEFAULT_TTL: u32 = 86400;
const RECORD_SUFFIX: &str = "Record";

/// Object-class membership as a bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectClassSet(u8);

impl ObjectClassSet {
    pub const CONFIG: ObjectClassSet = ObjectClassSet(1 << 0);
    pub const MASTER_ZONE: ObjectClassSet = ObjectClassSet(1 << 1);
    pub const FORWARD_ZONE: ObjectClassSet = ObjectClassSet(1 << 2);
    pub const RECORD: ObjectClassSet = ObjectClassSet(1 << 3);

    pub fn empty() -> Self {
        ObjectClassSet(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: ObjectClassSet) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: ObjectClassSet) -> bool {
        self.0 & other.0 == other.0
    }

    fn from_value(value: &str) -> Option<ObjectClassSet> {
        if value.eq_ignore_ascii_case("idnsConfigObject") {
            Some(Self::CONFIG)
        } else if value.eq_ignore_ascii_case("idnsZone") {
            Some(Self::MASTER_ZONE)
        } else if value.eq_ignore_ascii_case("idnsForwardZone") {
            Some(Self::FORWARD_ZONE)
        } else if value.eq_ignore_ascii_case("idnsRecord") {
            Some(Self::RECORD)
        } else {
            None
        }
    }
}

impl fmt::Display for ObjectClassSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, label) in [
            (Self::CONFIG, "config"),
            (Self::MASTER_ZONE, "master"),
            (Self::FORWARD_ZONE, "forward"),
            (Self::RECORD, "record"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(label)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// A directory entry as seen by the handlers.
#[derive(Debug, Clone)]
pub struct Entry {
    dn: String,
    change: ChangeType,
    classes: ObjectClassSet,
    attrs: Vec<(String, Vec<String>)>,
}

impl Entry {
    /// Materializes an entry event. Delete events carry no attributes, so
    /// their class set stays empty until the dispatcher infers one.
    pub fn from_raw(change: ChangeType, raw: RawEntry) -> Entry {
        let mut classes = ObjectClassSet::empty();
        if !change.is_delete() {
            for (name, values) in &raw.attrs {
                if name.eq_ignore_ascii_case(ATTR_OBJECT_CLASS) {
                    for value in values {
                        if let Some(class) = ObjectClassSet::from_value(value) {
                            classes.insert(class);
                        }
                    }
                }
            }
        }

        Entry {
            dn: raw.dn,
            change,
            classes,
            attrs: raw.attrs,
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn change(&self) -> ChangeType {
        self.change
    }

    pub fn classes(&self) -> ObjectClassSet {
        self.classes
    }

    pub fn set_classes(&mut self, classes: ObjectClassSet) {
        self.classes = classes;
    }

    /// All values of the named attribute; attribute names compare
    /// case-insensitively.
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
    }

    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }

    /// The node the entry's DN names.
    pub fn target(&self) -> Result<DnTarget> {
        codec::dn_to_name(&self.dn)
    }

    /// Node-wide TTL: `dnsTTL`, or 86400 when absent or unparseable.
    pub fn ttl(&self) -> Ttl {
        let secs = self
            .first(ATTR_TTL)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_TTL);
        Ttl::from_secs(secs)
    }

    pub fn class(&self) -> Class {
        Class::IN
    }

    /// `TRUE` unless the entry says otherwise.
    pub fn zone_active(&self) -> bool {
        self.first(ATTR_ZONE_ACTIVE)
            .map(|v| !v.eq_ignore_ascii_case("FALSE"))
            .unwrap_or(true)
    }

    /// Iterates over the `<RRTYPE>Record` attributes whose prefix names a
    /// record type known to the name server. Unknown prefixes are skipped.
    pub fn rr_attrs(&self) -> impl Iterator<Item = (&str, Rtype)> {
        self.attrs.iter().filter_map(|(name, _)| {
            if !name.is_ascii() {
                return None;
            }
            let prefix = name
                .len()
                .checked_sub(RECORD_SUFFIX.len())
                .map(|cut| &name[..cut])?;
            if !name[prefix.len()..].eq_ignore_ascii_case(RECORD_SUFFIX) || prefix.is_empty() {
                return None;
            }
            let rtype = prefix.to_ascii_uppercase().parse::<Rtype>().ok()?;
            // SOA never travels as a single text blob.
            if rtype == Rtype::SOA {
                return None;
            }
            Some((name.as_str(), rtype))
        })
    }

    /// Values of one `<RRTYPE>Record` attribute.
    pub fn rr_values(&self, attribute: &str) -> &[String] {
        self.values(attribute).unwrap_or(&[])
    }

    /// Composes SOA rdata text from the seven `idnsSOA*` attributes.
    /// `fake_mname` (when configured) overrides `idnsSOAmName`.
    pub fn fake_soa(&self, fake_mname: Option<&str>) -> Result<String> {
        let mname = match fake_mname {
            Some(mname) if !mname.is_empty() => mname,
            _ => self.soa_field(ATTR_SOA_MNAME)?,
        };
        Ok(format!(
            "{} {} {} {} {} {} {}",
            mname,
            self.soa_field(ATTR_SOA_RNAME)?,
            self.soa_field(ATTR_SOA_SERIAL)?,
            self.soa_field(ATTR_SOA_REFRESH)?,
            self.soa_field(ATTR_SOA_RETRY)?,
            self.soa_field(ATTR_SOA_EXPIRE)?,
            self.soa_field(ATTR_SOA_MINIMUM)?,
        ))
    }

    /// Whether the entry carries all mandatory SOA pieces.
    pub fn has_soa(&self) -> bool {
        [
            ATTR_SOA_RNAME,
            ATTR_SOA_SERIAL,
            ATTR_SOA_REFRESH,
            ATTR_SOA_RETRY,
            ATTR_SOA_EXPIRE,
            ATTR_SOA_MINIMUM,
        ]
        .iter()
        .all(|attr| self.first(attr).is_some())
    }

    fn soa_field(&self, attribute: &str) -> Result<&str> {
        self.first(attribute)
            .ok_or_else(|| error!(NotFound => "missing {} on {}", attribute, self.dn))
    }
}

/// Names the zone a record event belongs to, without interpreting the rest
/// of the entry.
pub fn zone_of(entry: &Entry) -> Result<Option<DnsName>> {
    Ok(match entry.target()? {
        DnTarget::Config => None,
        DnTarget::Zone { origin } => Some(origin),
        DnTarget::Record { origin, .. } => Some(origin),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::RawEntry;

    fn zone_entry() -> Entry {
        let raw = RawEntry::new("idnsName=example.org., cn=dns, dc=test")
            .with_attr(ATTR_OBJECT_CLASS, &["top", "idnsZone", "idnsRecord"])
            .with_attr(ATTR_SOA_MNAME, &["ns.example.org."])
            .with_attr(ATTR_SOA_RNAME, &["root.example.org."])
            .with_attr(ATTR_SOA_SERIAL, &["1"])
            .with_attr(ATTR_SOA_REFRESH, &["3600"])
            .with_attr(ATTR_SOA_RETRY, &["900"])
            .with_attr(ATTR_SOA_EXPIRE, &["1209600"])
            .with_attr(ATTR_SOA_MINIMUM, &["3600"])
            .with_attr("ARecord", &["192.0.2.1", "192.0.2.2"])
            .with_attr("aaaaRecord", &["2001:db8::1"])
            .with_attr("bogusRecord", &["x"])
            .with_attr("Record", &["y"]);
        Entry::from_raw(ChangeType::Add, raw)
    }

    #[test]
    fn classes_from_object_class_values() {
        let entry = zone_entry();
        assert!(entry.classes().contains(ObjectClassSet::MASTER_ZONE));
        assert!(entry.classes().contains(ObjectClassSet::RECORD));
        assert!(!entry.classes().contains(ObjectClassSet::FORWARD_ZONE));
    }

    #[test]
    fn delete_events_have_no_classes() {
        let raw = RawEntry::new("idnsName=example.org., cn=dns, dc=test")
            .with_attr(ATTR_OBJECT_CLASS, &["idnsZone"]);
        let entry = Entry::from_raw(ChangeType::Delete, raw);
        assert!(entry.classes().is_empty());
    }

    #[test]
    fn rr_attr_iteration_skips_unknown_types() {
        let entry = zone_entry();
        let mut types = entry.rr_attrs().map(|(_, t)| t).collect::<Vec<_>>();
        types.sort_by_key(|t| t.to_int());
        assert_eq!(types, vec![Rtype::A, Rtype::AAAA]);
    }

    #[test]
    fn ttl_defaults_to_a_day() {
        let entry = zone_entry();
        assert_eq!(entry.ttl(), Ttl::from_secs(86400));

        let raw = RawEntry::new("idnsName=h, idnsName=example.org., cn=dns, dc=test")
            .with_attr(ATTR_TTL, &["300"]);
        let entry = Entry::from_raw(ChangeType::Add, raw);
        assert_eq!(entry.ttl(), Ttl::from_secs(300));
    }

    #[test]
    fn fake_soa_composition() {
        let entry = zone_entry();
        assert_eq!(
            entry.fake_soa(None).unwrap(),
            "ns.example.org. root.example.org. 1 3600 900 1209600 3600"
        );
        assert_eq!(
            entry.fake_soa(Some("fake.master.test.")).unwrap(),
            "fake.master.test. root.example.org. 1 3600 900 1209600 3600"
        );
    }

    #[test]
    fn zone_active_flag() {
        let entry = zone_entry();
        assert!(entry.zone_active());

        let raw = RawEntry::new("idnsName=example.org., cn=dns, dc=test")
            .with_attr(ATTR_ZONE_ACTIVE, &["FALSE"]);
        let entry = Entry::from_raw(ChangeType::Modify, raw);
        assert!(!entry.zone_active());
    }
}
