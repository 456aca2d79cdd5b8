//! Updates scoped to a single owner name: the same diff/serial/journal
//! discipline as full projection, but touching one node only.

use std::collections::BTreeMap;
use std::sync::Arc;

use domain::base::iana::Rtype;

use crate::codec::{name_text, DnsName, DnTarget};
use crate::diff::Diff;
use crate::entry::{Entry, ObjectClassSet};
use crate::error::{ErrorKind, Result};
use crate::instance::Instance;
use crate::journal::Journal;
use crate::ldap::ChangeType;
use crate::projector;
use crate::register::ZoneInfo;
use crate::zone::{parse_rdata, LoadState, Rrset};
use crate::{fs, writeback};

/// Entry point for record events.
pub async fn record_handler(
    instance: &Arc<Instance>,
    entry: &Entry,
    change: ChangeType,
) -> Result<()> {
    let (owner, origin) = match entry.target()? {
        DnTarget::Record { owner, origin } => (owner, origin),
        DnTarget::Zone { origin } => {
            // Fallback classification of a delete for something never
            // served; nothing to do beyond saying so.
            return Err(
                error!(NotFound => "record event for {} names no registered zone", name_text(&origin)),
            );
        }
        DnTarget::Config => {
            return Err(error!(BadOwnerName => "record event at the config entry '{}'", entry.dn()))
        }
    };

    instance.check_exiting()?;

    // Record updates share the exclusive token with zone projections so a
    // projection running on the instance task never races an update on
    // the zone's own task.
    let _exclusive = instance.exclusive.lock().await;

    let info = instance.register.get(&origin).ok_or_else(
        || error!(NotFound => "zone {} is not registered", name_text(&origin)),
    )?;

    match apply_record(instance, entry, change, &info, &owner).await {
        Err(e) if matches!(e.kind, ErrorKind::NotLoaded | ErrorKind::BadZone) => {
            // One reload, one retry; a second failure taints via the
            // dispatcher.
            log::warn!(
                target: "record",
                "update of {} hit '{}'; reloading {} and retrying",
                name_text(&owner),
                e,
                name_text(&origin)
            );
            reload_zone(instance, &info).await?;
            apply_record(instance, entry, change, &info, &owner).await
        }
        other => other,
    }
}

async fn apply_record(
    instance: &Arc<Instance>,
    entry: &Entry,
    change: ChangeType,
    info: &Arc<ZoneInfo>,
    owner: &DnsName,
) -> Result<()> {
    let origin = &info.origin;
    let sync_finished = instance.barrier.is_finished();

    if sync_finished && instance.view.state(origin).is_none() {
        return Err(error!(NotLoaded => "zone {} is not in the view", name_text(origin)));
    }

    // Desired state of the node: empty on delete, the entry's records
    // otherwise.
    let mut desired: BTreeMap<(DnsName, Rtype), Rrset> = BTreeMap::new();
    if !change.is_delete() {
        // An entry doubling as a master-zone object contributes its SOA
        // before the plain record attributes.
        if entry.classes().contains(ObjectClassSet::MASTER_ZONE) && entry.has_soa() {
            let soa_text = entry.fake_soa(None)?;
            let soa = parse_rdata(owner, entry.ttl(), Rtype::SOA, &soa_text)?;
            let mut rrset = Rrset::new(Rtype::SOA, entry.ttl());
            rrset.data.push(soa);
            desired.insert((owner.clone(), Rtype::SOA), rrset);
        }
        projector::collect_rr_attrs(entry, owner, entry.ttl(), &mut desired)?;
    }
    let desired: Vec<(DnsName, Rrset)> = desired
        .into_iter()
        .map(|((name, _), set)| (name, set))
        .collect();

    let snapshot = info.db.read();
    let current: Vec<(DnsName, Rrset)> = snapshot
        .rrsets_at(owner)
        .into_iter()
        .map(|rrset| (owner.clone(), rrset))
        .collect();

    let mut diff = Diff::between(origin.clone(), &current, &desired);
    if diff.is_empty() {
        // Typically our own write-back echoed through the stream.
        log::debug!(target: "record", "{} unchanged", name_text(owner));
        return Ok(());
    }
    if instance
        .local_settings
        .get_bool(crate::instance::keys::VERBOSE_CHECKS)
        .unwrap_or(false)
    {
        for tuple in diff.tuples() {
            log::debug!(target: "record", "{}: {:?}", name_text(owner), tuple);
        }
    }

    if sync_finished {
        let (soa_ttl, soa) = snapshot.soa(origin).ok_or_else(
            || error!(BadZone => "zone {} has no SOA", name_text(origin)),
        )?;
        let serial = diff.prepend_soa_bump(soa_ttl, &soa);
        writeback::write_soa_serial(instance, &info.dn, serial).await?;

        let paths = fs::zone_paths(&instance.data_dir(), origin)?;
        Journal::open(&paths.journal)?.append(&diff)?;
    }

    let mut txn = info.db.new_version();
    diff.apply(&mut txn)
        .map_err(|e| error!(BadZone => "zone {} diverged at {}: {}", name_text(origin), name_text(owner), e))?;
    txn.commit();

    log::info!(
        target: "record",
        "{}: applied {} tuples at {}",
        name_text(origin),
        diff.tuples().len(),
        name_text(owner)
    );
    Ok(())
}

/// Re-publishes and re-materializes a zone whose view copy went bad.
/// Caller holds exclusive mode.
async fn reload_zone(instance: &Arc<Instance>, info: &Arc<ZoneInfo>) -> Result<()> {
    if !instance.view.contains(&info.origin) {
        instance.view.publish(info.db.clone())?;
    }
    projector::load_zone(instance, info).await?;
    instance.view.set_state(&info.origin, LoadState::Active)?;
    Ok(())
}
