//! Classifies entry events and posts them, as typed jobs, onto the task
//! that serializes their target: per-zone tasks for zone and record work,
//! the instance task for everything else.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::codec::{self, DnTarget};
use crate::entry::{Entry, ObjectClassSet};
use crate::error::{ErrorKind, Result};
use crate::instance::Instance;
use crate::ldap::{ChangeType, RawEntry};
use crate::task::Task;
use crate::{projector, record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Config,
    Master,
    Forward,
    Record,
}

/// Decides what an event is about. Add/modify events carry their object
/// classes; deletes carry nothing and are classified from what the engine
/// already serves.
pub fn classify(instance: &Instance, change: ChangeType, entry: &mut Entry) -> Result<EntryClass> {
    if codec::dn_canonical(entry.dn()) == codec::dn_canonical(&instance.config.base) {
        return Ok(EntryClass::Config);
    }

    let target = entry.target()?;

    if !change.is_delete() {
        let classes = entry.classes();
        if classes.contains(ObjectClassSet::MASTER_ZONE) {
            return Ok(EntryClass::Master);
        }
        if classes.contains(ObjectClassSet::FORWARD_ZONE) {
            return Ok(EntryClass::Forward);
        }
        if classes.contains(ObjectClassSet::CONFIG) {
            return Ok(EntryClass::Config);
        }
        return Ok(EntryClass::Record);
    }

    // Delete events: infer from prior knowledge.
    let class = match &target {
        DnTarget::Config => EntryClass::Config,
        DnTarget::Zone { origin } => {
            if instance.forward.contains(origin) {
                EntryClass::Forward
            } else if instance.register.get(origin).is_some() {
                EntryClass::Master
            } else {
                EntryClass::Record
            }
        }
        DnTarget::Record { .. } => EntryClass::Record,
    };
    entry.set_classes(match class {
        EntryClass::Master => ObjectClassSet::MASTER_ZONE,
        EntryClass::Forward => ObjectClassSet::FORWARD_ZONE,
        EntryClass::Record => ObjectClassSet::RECORD,
        EntryClass::Config => ObjectClassSet::CONFIG,
    });
    Ok(class)
}

/// The task an event must run on: the zone's own task where one exists,
/// the instance task otherwise.
fn target_task(instance: &Instance, class: EntryClass, entry: &Entry) -> Task {
    let zone_task = match (class, entry.target()) {
        (EntryClass::Master, Ok(DnTarget::Zone { origin })) => {
            instance.register.get(&origin).map(|info| info.task.clone())
        }
        (EntryClass::Record, Ok(DnTarget::Record { origin, .. })) => {
            instance.register.get(&origin).map(|info| info.task.clone())
        }
        _ => None,
    };
    zone_task.unwrap_or_else(|| instance.task.clone())
}

/// Accepts one stream event. Never blocks and never fails: classification
/// problems are logged and the entry is skipped, handler errors are dealt
/// with inside the posted job.
pub fn dispatch_event(
    instance: &Arc<Instance>,
    change: ChangeType,
    raw: RawEntry,
    permit: OwnedSemaphorePermit,
) {
    let mut entry = Entry::from_raw(change, raw);

    let class = match classify(instance, change, &mut entry) {
        Ok(class) => class,
        Err(e) => {
            log::error!(
                target: "dispatch",
                "bug: cannot classify entry '{}': {}; entry skipped",
                entry.dn(),
                e
            );
            return;
        }
    };
    log::debug!(
        target: "dispatch",
        "{:?} event for '{}' -> {:?}",
        change,
        entry.dn(),
        class
    );

    let task = target_task(instance, class, &entry);
    let tracked = instance.barrier.track();
    let instance = instance.clone();

    let posted = task.post(async move {
        let _permit = permit;
        let _tracked = tracked;

        let dn = entry.dn().to_string();
        let outcome = match class {
            EntryClass::Config => instance.configure(&entry),
            EntryClass::Master | EntryClass::Forward => {
                projector::zone_handler(&instance, &entry, change).await
            }
            EntryClass::Record => record::record_handler(&instance, &entry, change).await,
        };

        if let Err(e) = outcome {
            match e.kind {
                ErrorKind::Shutdown => {
                    log::debug!(target: "dispatch", "'{}' dropped at shutdown", dn)
                }
                ErrorKind::BadZone => {
                    log::error!(target: "dispatch", "handler for '{}' failed: {}", dn, e);
                    instance.taint(&format!("handler for '{}' failed: {}", dn, e));
                }
                _ => log::error!(target: "dispatch", "handler for '{}' failed: {}", dn, e),
            }
        }
    });

    if posted.is_err() {
        log::debug!(target: "dispatch", "task queue gone; event dropped at shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entry::Entry;
    use crate::instance::Instance;
    use crate::ldap::{DirBackend, DirConn, RawEntry};

    struct NullBackend;

    #[async_trait::async_trait]
    impl DirBackend for NullBackend {
        async fn connect(&self, _config: &Config) -> Result<Box<dyn DirConn>> {
            Err(error!(NotConnected))
        }
    }

    fn instance() -> Arc<Instance> {
        let config = Config::try_from(
            "uri: ldap://localhost\nbase: cn=dns, dc=example,dc=test\n".as_bytes(),
        )
        .unwrap();
        Instance::new("test", config, Arc::new(NullBackend))
    }

    fn entry(dn: &str, change: ChangeType, classes: &[&str]) -> Entry {
        let mut raw = RawEntry::new(dn);
        if !classes.is_empty() {
            raw = raw.with_attr("objectClass", classes);
        }
        Entry::from_raw(change, raw)
    }

    #[tokio::test]
    async fn base_dn_is_config() {
        let instance = instance();
        let mut e = entry(
            "CN=dns, DC=Example, DC=test",
            ChangeType::Modify,
            &["idnsConfigObject"],
        );
        let class = classify(&instance, ChangeType::Modify, &mut e).unwrap();
        assert_eq!(class, EntryClass::Config);
    }

    #[tokio::test]
    async fn object_classes_route_adds() {
        let instance = instance();

        let mut e = entry(
            "idnsName=example.org., cn=dns, dc=example,dc=test",
            ChangeType::Add,
            &["idnsZone", "idnsRecord"],
        );
        assert_eq!(
            classify(&instance, ChangeType::Add, &mut e).unwrap(),
            EntryClass::Master
        );

        let mut e = entry(
            "idnsName=fwd.org., cn=dns, dc=example,dc=test",
            ChangeType::Add,
            &["idnsForwardZone"],
        );
        assert_eq!(
            classify(&instance, ChangeType::Add, &mut e).unwrap(),
            EntryClass::Forward
        );

        let mut e = entry(
            "idnsName=host, idnsName=example.org., cn=dns, dc=example,dc=test",
            ChangeType::Add,
            &["idnsRecord"],
        );
        assert_eq!(
            classify(&instance, ChangeType::Add, &mut e).unwrap(),
            EntryClass::Record
        );
    }

    #[tokio::test]
    async fn deletes_fall_back_to_prior_knowledge() {
        let instance = instance();

        // nothing known: record fallback
        let mut e = entry(
            "idnsName=gone.org., cn=dns, dc=example,dc=test",
            ChangeType::Delete,
            &[],
        );
        assert_eq!(
            classify(&instance, ChangeType::Delete, &mut e).unwrap(),
            EntryClass::Record
        );

        // forward register wins
        instance.forward.add(
            crate::codec::DnsName::bytes_from_str("gone.org.").unwrap(),
            crate::forward::ForwardZone {
                policy: crate::forward::ForwardPolicy::Only,
                forwarders: vec!["192.0.2.53".parse().unwrap()],
            },
        );
        let mut e = entry(
            "idnsName=gone.org., cn=dns, dc=example,dc=test",
            ChangeType::Delete,
            &[],
        );
        assert_eq!(
            classify(&instance, ChangeType::Delete, &mut e).unwrap(),
            EntryClass::Forward
        );
    }

    #[tokio::test]
    async fn multi_valued_rdn_is_a_classification_bug() {
        let instance = instance();
        let mut e = entry(
            "idnsName=a+sn=b, idnsName=example.org., cn=dns, dc=example,dc=test",
            ChangeType::Add,
            &["idnsRecord"],
        );
        let err = classify(&instance, ChangeType::Add, &mut e).unwrap_err();
        assert!(err.is(ErrorKind::NotImplemented));
    }
}
