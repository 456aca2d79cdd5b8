//! Projection of master-zone entries into live zone databases: zone
//! lifecycle, forwarder overrides, settings and policy installation, RR
//! parsing, minimal diffing with serial maintenance, journal persistence
//! and (re)loading.

use std::collections::BTreeMap;
use std::sync::Arc;

use domain::base::iana::Rtype;
use domain::base::Ttl;

use crate::codec::{name_text, DnsName, DnTarget};
use crate::diff::Diff;
use crate::entry::{Entry, ObjectClassSet};
use crate::error::Result;
use crate::forward::{self, ForwardPolicy, ForwardZone};
use crate::instance::{keys, Instance};
use crate::journal::Journal;
use crate::ldap::ChangeType;
use crate::register::ZoneInfo;
use crate::settings::Value;
use crate::task::Task;
use crate::zone::{parse_rdata, LoadState, Rrset, ZoneDb};
use crate::{fs, writeback};

/// Entry point for master- and forward-zone events.
pub async fn zone_handler(instance: &Arc<Instance>, entry: &Entry, change: ChangeType) -> Result<()> {
    let origin = match entry.target()? {
        DnTarget::Zone { origin } => origin,
        other => {
            return Err(
                error!(BadOwnerName => "zone event '{}' does not name a zone ({:?})", entry.dn(), other),
            )
        }
    };

    instance.check_exiting()?;

    // Enter exclusive mode: zone-manager state and zone contents may only
    // be rewritten by one handler at a time, even when a not-yet-known
    // zone's work runs on the instance task.
    let _exclusive = instance.exclusive.lock().await;

    if change.is_delete() || !entry.zone_active() {
        return retire_zone(instance, &origin).await;
    }

    if entry.classes().contains(ObjectClassSet::MASTER_ZONE) {
        project_master(instance, entry, &origin).await
    } else if entry.classes().contains(ObjectClassSet::FORWARD_ZONE) {
        forward_zone_handler(instance, entry, &origin).await
    } else {
        Err(error!(NotImplemented => "'{}' is neither master nor forward", entry.dn()))
    }
}

/// Removes every trace of a zone: register entry, view membership, files.
/// Caller holds exclusive mode.
async fn retire_zone(instance: &Arc<Instance>, origin: &DnsName) -> Result<()> {
    let removed_forward = instance.forward.delete(origin);
    let removed_master = match instance.register.delete(origin) {
        Ok(info) => {
            if instance.view.contains(origin) && !instance.view.is_builtin(origin) {
                instance.view.unload(origin)?;
            }
            let paths = fs::zone_paths(&instance.data_dir(), origin)?;
            fs::remove_zone_dir(&paths)?;
            drop(info);
            true
        }
        Err(_) => false,
    };

    if removed_forward || removed_master {
        instance.view.flush_cache();
        log::info!(target: "projector", "zone {} retired", name_text(origin));
    } else {
        log::debug!(
            target: "projector",
            "delete for unknown zone {} ignored",
            name_text(origin)
        );
    }
    Ok(())
}

/// Handles a dedicated forward-zone entry. Caller holds exclusive mode.
async fn forward_zone_handler(
    instance: &Arc<Instance>,
    entry: &Entry,
    origin: &DnsName,
) -> Result<()> {
    let policy = match entry.first("idnsForwardPolicy") {
        Some(text) => ForwardPolicy::parse(text)?,
        None => ForwardPolicy::First,
    };
    let forwarders = entry
        .values("idnsForwarders")
        .map(|values| forward::parse_forwarders(values))
        .transpose()?
        .unwrap_or_default();

    if policy == ForwardPolicy::None || forwarders.is_empty() {
        log::warn!(
            target: "projector",
            "forward zone {} has no usable forwarders; forwarding disabled",
            name_text(origin)
        );
        instance.forward.delete(origin);
        instance.view.flush_cache();
        return Ok(());
    }

    instance
        .forward
        .add(origin.clone(), ForwardZone { policy, forwarders });

    // A forward zone shadows a projected master of the same name.
    if instance.register.get(origin).is_some() {
        retire_zone_keep_forward(instance, origin).await?;
    } else {
        instance.view.flush_cache();
    }
    Ok(())
}

/// Caller holds exclusive mode.
async fn retire_zone_keep_forward(instance: &Arc<Instance>, origin: &DnsName) -> Result<()> {
    if let Ok(_info) = instance.register.delete(origin) {
        if instance.view.contains(origin) && !instance.view.is_builtin(origin) {
            instance.view.unload(origin)?;
        }
        let paths = fs::zone_paths(&instance.data_dir(), origin)?;
        fs::remove_zone_dir(&paths)?;
    }
    instance.view.flush_cache();
    Ok(())
}

/// Projects a master-zone entry: forwarder override, zone creation,
/// settings and ACL installation, RR parsing, diff and serial handling,
/// journal write, load. Caller holds exclusive mode.
async fn project_master(instance: &Arc<Instance>, entry: &Entry, origin: &DnsName) -> Result<()> {
    // Forwarder override: a master entry carrying a live forward policy
    // turns into a forward zone instead.
    if let Some(policy_text) = entry.first("idnsForwardPolicy") {
        match ForwardPolicy::parse(policy_text) {
            Ok(ForwardPolicy::None) => {
                instance.forward.delete(origin);
            }
            Ok(policy) => {
                let forwarders = entry
                    .values("idnsForwarders")
                    .map(|values| forward::parse_forwarders(values))
                    .transpose();
                match forwarders {
                    Ok(Some(forwarders)) if !forwarders.is_empty() => {
                        instance
                            .forward
                            .add(origin.clone(), ForwardZone { policy, forwarders });
                        retire_zone_keep_forward(instance, origin).await?;
                        log::info!(
                            target: "projector",
                            "master zone {} taken over by forwarders",
                            name_text(origin)
                        );
                        return Ok(());
                    }
                    Ok(_) | Err(_) => {
                        // Takeover needs at least one valid forwarder.
                        log::warn!(
                            target: "projector",
                            "zone {} has forward policy '{}' but no valid forwarders; \
                             staying master",
                            name_text(origin),
                            policy_text
                        );
                        instance.forward.delete(origin);
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    target: "projector",
                    "zone {}: {}; forwarding disabled",
                    name_text(origin),
                    e
                );
                instance.forward.delete(origin);
            }
        }
    } else {
        instance.forward.delete(origin);
    }

    // Ensure the zone object exists.
    let (info, fresh_zone) = match instance.register.get(origin) {
        Some(info) => (info, false),
        None => {
            let paths = fs::zone_paths(&instance.data_dir(), origin)?;
            fs::prepare_zone_dir(&paths)?;

            if instance.view.is_builtin(origin) {
                // Replace the host's built-in empty zone.
                instance.view.unload(origin)?;
            }

            let info = instance.register.add(ZoneInfo {
                origin: origin.clone(),
                dn: entry.dn().to_string(),
                db: ZoneDb::new(origin.clone(), entry.class()),
                secure_db: None,
                settings: instance.new_zone_settings(&name_text(origin)),
                task: Task::spawn(&format!("zone-{}", name_text(origin))),
            })?;
            log::info!(target: "projector", "zone {} created", name_text(origin));
            (info, true)
        }
    };

    match project_master_inner(instance, entry, &info, fresh_zone).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if fresh_zone {
                // Roll the half-created zone back out.
                let _ = retire_zone(instance, origin).await;
            }
            Err(e)
        }
    }
}

async fn project_master_inner(
    instance: &Arc<Instance>,
    entry: &Entry,
    info: &Arc<ZoneInfo>,
    fresh_zone: bool,
) -> Result<()> {
    let origin = &info.origin;

    // Settings carried on the zone entry.
    info.settings.update_from_entry(
        entry,
        &[
            (keys::DYN_UPDATE, "idnsAllowDynUpdate"),
            (keys::SYNC_PTR, "idnsAllowSyncPTR"),
            (keys::UPDATE_POLICY, "idnsUpdatePolicy"),
        ],
    )?;
    if info.settings.get_bool(keys::DYN_UPDATE).unwrap_or(false) {
        let policy = info.settings.get_str(keys::UPDATE_POLICY).unwrap_or_default();
        log::debug!(
            target: "projector",
            "zone {}: dynamic updates enabled, policy '{}'",
            name_text(origin),
            policy
        );
    }

    install_acl(info, entry, "idnsAllowQuery", keys::ALLOW_QUERY);
    install_acl(info, entry, "idnsAllowTransfer", keys::ALLOW_TRANSFER);

    let sync_finished = instance.barrier.is_finished();

    // Publication is deferred until the initial refresh has drained.
    if fresh_zone && sync_finished {
        instance.view.publish(info.db.clone())?;
    }

    // Desired state of the origin node: SOA first, then every record
    // attribute. Records below the apex belong to their own entries and
    // are out of a zone projection's reach.
    let desired = parse_zone_rrsets(entry, origin, instance)?;
    let snapshot = info.db.read();
    let current: Vec<(DnsName, Rrset)> = snapshot
        .rrsets_at(origin)
        .into_iter()
        .map(|rrset| (origin.clone(), rrset))
        .collect();

    let mut diff = Diff::between(origin.clone(), &current, &desired);
    let plan = diff.analyze_serial(snapshot.soa(origin), fresh_zone, sync_finished)?;

    if diff.is_empty() {
        log::debug!(target: "projector", "zone {} unchanged", name_text(origin));
        return Ok(());
    }

    let mut txn = info.db.new_version();
    diff.apply(&mut txn)?;
    txn.commit();

    let paths = fs::zone_paths(&instance.data_dir(), origin)?;
    if sync_finished && !fresh_zone {
        Journal::open(&paths.journal)?.append(&diff)?;
    }

    if let Some(serial) = plan.to_write {
        writeback::write_soa_serial(instance, &info.dn, serial).await?;
    }

    if sync_finished && plan.data_changed {
        load_zone(instance, info).await?;
        instance.view.set_state(origin, LoadState::Active)?;
    }

    log::info!(
        target: "projector",
        "zone {} projected ({} tuples{})",
        name_text(origin),
        diff.tuples().len(),
        if plan.data_changed { "" } else { ", serial only" }
    );
    Ok(())
}

/// Builds the desired rrsets of the zone entry. SOA synthesis runs before
/// the ordinary record attributes.
fn parse_zone_rrsets(
    entry: &Entry,
    origin: &DnsName,
    instance: &Arc<Instance>,
) -> Result<Vec<(DnsName, Rrset)>> {
    let mut desired: BTreeMap<(DnsName, Rtype), Rrset> = BTreeMap::new();
    let ttl = entry.ttl();

    let fake_mname = instance
        .local_settings
        .get_str(keys::FAKE_MNAME)
        .unwrap_or_default();
    let fake_mname = (!fake_mname.is_empty()).then_some(fake_mname);
    let soa_text = entry.fake_soa(fake_mname.as_deref())?;
    let soa = parse_rdata(origin, ttl, Rtype::SOA, &soa_text)?;
    let mut rrset = Rrset::new(Rtype::SOA, ttl);
    rrset.data.push(soa);
    desired.insert((origin.clone(), Rtype::SOA), rrset);

    collect_rr_attrs(entry, origin, ttl, &mut desired)?;

    Ok(desired.into_iter().map(|((name, _), set)| (name, set)).collect())
}

/// Shared with the record updater: every `<type>Record` attribute of an
/// entry parsed into rrsets at `owner`.
pub fn collect_rr_attrs(
    entry: &Entry,
    owner: &DnsName,
    ttl: Ttl,
    into: &mut BTreeMap<(DnsName, Rtype), Rrset>,
) -> Result<()> {
    for (attribute, rtype) in entry.rr_attrs() {
        for value in entry.rr_values(attribute) {
            let rdata = parse_rdata(owner, ttl, rtype, value)?;
            let rrset = into
                .entry((owner.clone(), rtype))
                .or_insert_with(|| Rrset::new(rtype, ttl));
            if rrset.ttl != ttl {
                return Err(error!(NotImplemented =>
                    "conflicting TTLs in the {} rrset at {}",
                    rtype,
                    name_text(owner)
                ));
            }
            rrset.data.push(rdata);
        }
    }
    Ok(())
}

/// Validates an ACL attribute and stores it; a broken ACL collapses to
/// `none` so nothing is accidentally allowed.
fn install_acl(info: &Arc<ZoneInfo>, entry: &Entry, attribute: &str, key: &'static str) {
    let Some(values) = entry.values(attribute) else {
        let _ = info.settings.unset(key);
        return;
    };
    let text = values.join("; ");
    match validate_acl(&text) {
        Ok(()) => {
            let _ = info.settings.set(key, Value::Str(text));
        }
        Err(e) => {
            log::error!(
                target: "audit",
                "zone {}: invalid {} '{}' ({}); falling back to 'none'",
                name_text(&info.origin),
                attribute,
                text,
                e
            );
            let _ = info.settings.set(key, Value::Str("none".to_string()));
        }
    }
}

/// Accepts the address-match-list subset the schema uses: keywords,
/// addresses, prefixes, negations.
pub fn validate_acl(text: &str) -> Result<()> {
    for element in text
        .split([';', ' ', '\t'])
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        let element = element.strip_prefix('!').unwrap_or(element);
        let keyword = element.eq_ignore_ascii_case("any")
            || element.eq_ignore_ascii_case("none")
            || element.eq_ignore_ascii_case("localhost")
            || element.eq_ignore_ascii_case("localnets");
        if keyword {
            continue;
        }
        let address = match element.split_once('/') {
            Some((addr, len)) => {
                addr.parse::<std::net::IpAddr>().is_ok() && len.parse::<u8>().is_ok()
            }
            None => element.parse::<std::net::IpAddr>().is_ok(),
        };
        if !address {
            return Err(error!(UnexpectedToken => "'{}' is not an ACL element", element));
        }
    }
    Ok(())
}

/// Materializes the zone on disk and marks it loaded.
pub async fn load_zone(instance: &Arc<Instance>, info: &Arc<ZoneInfo>) -> Result<()> {
    let paths = fs::zone_paths(&instance.data_dir(), &info.origin)?;
    fs::write_zone_file(&paths, &info.db)?;
    instance.view.set_state(&info.origin, LoadState::Loaded)?;
    log::info!(target: "projector", "zone {} loaded", name_text(&info.origin));
    Ok(())
}

/// Publishes and loads every zone registered during the initial refresh.
/// Runs once, right after the barrier drains.
pub async fn publish_pending(instance: &Arc<Instance>) -> Result<()> {
    let _exclusive = instance.exclusive.lock().await;
    for origin in instance.register.origins() {
        let Some(info) = instance.register.get(&origin) else {
            continue;
        };
        if !instance.view.contains(&origin) || instance.view.is_builtin(&origin) {
            if instance.view.is_builtin(&origin) {
                instance.view.unload(&origin)?;
            }
            instance.view.publish(info.db.clone())?;
        }
        load_zone(instance, &info).await?;
        instance.view.set_state(&origin, LoadState::Active)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_validation() {
        validate_acl("any").unwrap();
        validate_acl("none").unwrap();
        validate_acl("localhost; localnets").unwrap();
        validate_acl("192.0.2.0/24; !192.0.2.1; 2001:db8::/32").unwrap();
        assert!(validate_acl("192.0.2.0/24; bogus").is_err());
        assert!(validate_acl("keyname").is_err());
    }
}
