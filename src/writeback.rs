//! Translation of zone-manager mutations into directory modifications,
//! and the PTR twin-write that keeps reverse zones aligned with A/AAAA
//! updates.

use std::sync::Arc;

use domain::base::iana::Rtype;
use domain::base::{RecordData, Serial};
use domain::rdata::ZoneRecordData;

use crate::codec::{name_text, DnsName};
use crate::entry::{
    ATTR_SOA_EXPIRE, ATTR_SOA_MINIMUM, ATTR_SOA_REFRESH, ATTR_SOA_RETRY, ATTR_SOA_SERIAL,
};
use crate::error::{ErrorKind, Result};
use crate::instance::{keys, Instance};
use crate::ldap::{DirConn, Mod};
use crate::register::ZoneInfo;
use crate::zone::{Rdata, Rrset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Add,
    Delete,
}

/// `<type>Record`, the attribute carrying a record type's values.
pub fn record_attribute(rtype: Rtype) -> String {
    format!("{}Record", rtype)
}

/// Runs one modification batch against the directory, with the two
/// schema-level conventions the engine relies on: deleting a value that is
/// already gone succeeds silently, and adding to a missing entry creates
/// it as an `idnsRecord` object. A connection failure is retried exactly
/// once on a rebound connection.
pub async fn modify_do(instance: &Arc<Instance>, dn: &str, mods: &[Mod]) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut pooled = instance.pool.acquire().await?;
        let outcome = run_mods(pooled.slot.conn()?, dn, mods).await;
        match outcome {
            Err(e) if e.is_connection() && attempt == 1 => {
                log::warn!(
                    target: "writeback",
                    "modify of '{}' lost its connection ({}); retrying once",
                    dn,
                    e
                );
                pooled.slot.mark_disconnected();
                drop(pooled);
                continue;
            }
            other => return other,
        }
    }
}

async fn run_mods(conn: &mut dyn DirConn, dn: &str, mods: &[Mod]) -> Result<()> {
    match conn.modify(dn, mods).await {
        Ok(()) => Ok(()),
        Err(e) if e.is(ErrorKind::NotFound) => {
            if mods.iter().all(|m| matches!(m, Mod::Delete(..))) {
                // Nothing to delete is the desired state already.
                Ok(())
            } else if mods
                .iter()
                .any(|m| matches!(m, Mod::Add(..) | Mod::Replace(..)))
            {
                let mut attrs: Vec<(String, Vec<String>)> = vec![(
                    "objectClass".to_string(),
                    vec!["idnsRecord".to_string()],
                )];
                for m in mods {
                    if matches!(m, Mod::Add(..) | Mod::Replace(..)) {
                        attrs.push((m.attribute().to_string(), m.values().to_vec()));
                    }
                }
                conn.add(dn, &attrs).await
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

/// Replaces the stored SOA serial after a projection bumped it.
pub async fn write_soa_serial(instance: &Arc<Instance>, dn: &str, serial: Serial) -> Result<()> {
    let mods = [Mod::Replace(
        ATTR_SOA_SERIAL.to_string(),
        vec![serial.into_int().to_string()],
    )];
    modify_do(instance, dn, &mods).await?;
    log::debug!(target: "writeback", "'{}' serial -> {}", dn, serial);
    Ok(())
}

fn soa_mods(soa_rdata: &Rdata) -> Result<Vec<Mod>> {
    let ZoneRecordData::Soa(soa) = soa_rdata else {
        return Err(error!(BadZone => "SOA write-back got {} data", soa_rdata.rtype()));
    };
    Ok(vec![
        Mod::Replace(
            ATTR_SOA_SERIAL.to_string(),
            vec![soa.serial().into_int().to_string()],
        ),
        Mod::Replace(
            ATTR_SOA_REFRESH.to_string(),
            vec![soa.refresh().as_secs().to_string()],
        ),
        Mod::Replace(
            ATTR_SOA_RETRY.to_string(),
            vec![soa.retry().as_secs().to_string()],
        ),
        Mod::Replace(
            ATTR_SOA_EXPIRE.to_string(),
            vec![soa.expire().as_secs().to_string()],
        ),
        Mod::Replace(
            ATTR_SOA_MINIMUM.to_string(),
            vec![soa.minimum().as_secs().to_string()],
        ),
    ])
}

fn value_mods(op: UpdateOp, rrset: &Rrset) -> Result<Vec<Mod>> {
    if rrset.rtype == Rtype::SOA {
        // SOA travels as its five idnsSOA* fields, never as one value.
        let rdata = rrset
            .data
            .first()
            .ok_or_else(|| error!(BadZone => "empty SOA rrset"))?;
        return soa_mods(rdata);
    }
    let attribute = record_attribute(rrset.rtype);
    let values: Vec<String> = rrset.data.iter().map(|rdata| rdata.to_string()).collect();
    Ok(vec![match op {
        UpdateOp::Add => Mod::Add(attribute, values),
        UpdateOp::Delete => Mod::Delete(attribute, values),
    }])
}

/// Writes an rrset's values onto the entry owning `owner`.
pub async fn write_rdata(instance: &Arc<Instance>, owner: &DnsName, rrset: &Rrset) -> Result<()> {
    let dn = instance.register.dn_for_name(owner)?;
    modify_do(instance, &dn, &value_mods(UpdateOp::Add, rrset)?).await
}

/// Removes an rrset's values; `delete_node` drops the whole entry once its
/// last record is gone.
pub async fn remove_rdata(
    instance: &Arc<Instance>,
    owner: &DnsName,
    rrset: &Rrset,
    delete_node: bool,
) -> Result<()> {
    let dn = instance.register.dn_for_name(owner)?;
    if delete_node {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut pooled = instance.pool.acquire().await?;
            let outcome = pooled.slot.conn()?.delete(&dn).await;
            return match outcome {
                Err(e) if e.is_connection() && attempt == 1 => {
                    pooled.slot.mark_disconnected();
                    drop(pooled);
                    continue;
                }
                Err(e) if e.is(ErrorKind::NotFound) => Ok(()),
                other => other,
            };
        }
    } else {
        modify_do(instance, &dn, &value_mods(UpdateOp::Delete, rrset)?).await
    }
}

/// What the PTR pre-validation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PtrAction {
    /// Reverse side already matches; nothing to write.
    Skip,
    Apply { delete_node: bool },
}

/// The reverse-map owner of an address record.
pub fn reverse_name(rdata: &Rdata) -> Result<DnsName> {
    let text = match rdata {
        ZoneRecordData::A(a) => {
            let octets = a.addr().octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa.",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        ZoneRecordData::Aaaa(aaaa) => {
            let mut labels = Vec::with_capacity(32);
            for byte in aaaa.addr().octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0F));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa.", labels.join("."))
        }
        other => {
            return Err(
                error!(NotImplemented => "no reverse map for {} records", other.rtype()),
            )
        }
    };
    DnsName::bytes_from_str(&text).map_err(|e| error!(DomainStr => "{}", e))
}

/// The strict gate: decides whether the paired PTR write may proceed.
/// Refusals here refuse the primary update as well.
fn validate_ptr(
    reverse_zone: &Arc<ZoneInfo>,
    reverse_owner: &DnsName,
    owner: &DnsName,
    op: UpdateOp,
) -> Result<PtrAction> {
    if !reverse_zone
        .settings
        .get_bool(keys::DYN_UPDATE)
        .unwrap_or(false)
    {
        return Err(error!(NoPerm =>
            "reverse zone {} does not accept dynamic updates",
            name_text(&reverse_zone.origin)
        ));
    }

    let snapshot = reverse_zone.db.read();
    let ptr_set = snapshot.rrset(reverse_owner, Rtype::PTR);
    let targets: Vec<DnsName> = ptr_set
        .iter()
        .flat_map(|rrset| rrset.data.iter())
        .filter_map(|rdata| match rdata {
            ZoneRecordData::Ptr(ptr) => Some(ptr.ptrdname().clone()),
            _ => None,
        })
        .collect();

    match op {
        UpdateOp::Add => {
            if targets.iter().any(|target| target == owner) {
                Ok(PtrAction::Skip)
            } else if !targets.is_empty() {
                Err(error!(Singleton =>
                    "{} already points at {}",
                    name_text(reverse_owner),
                    name_text(&targets[0])
                ))
            } else {
                Ok(PtrAction::Apply { delete_node: false })
            }
        }
        UpdateOp::Delete => {
            if targets.is_empty() {
                Ok(PtrAction::Skip)
            } else if targets.len() == 1 && targets[0] == *owner {
                // The PTR may be the node's only record; then the whole
                // entry goes.
                let only_record = snapshot.rrsets_at(reverse_owner).len() == 1;
                Ok(PtrAction::Apply {
                    delete_node: only_record,
                })
            } else {
                Err(error!(UnexpectedToken =>
                    "{} does not point (only) at {}",
                    name_text(reverse_owner),
                    name_text(owner)
                ))
            }
        }
    }
}

/// A dynamic update intercepted from the host: writes the primary values
/// to the directory and, for A/AAAA under a sync-enabled zone, mutates the
/// paired PTR entry. The PTR validation gates the whole update; later PTR
/// write failures are logged but do not undo the primary write.
pub async fn update_write(
    instance: &Arc<Instance>,
    owner: &DnsName,
    rrset: &Rrset,
    op: UpdateOp,
) -> Result<()> {
    let zone = instance.register.find(owner).ok_or_else(
        || error!(NotFound => "no zone serves {}", name_text(owner)),
    )?;
    let sync_ptr = rrset.rtype == Rtype::A || rrset.rtype == Rtype::AAAA;
    let sync_ptr =
        sync_ptr && zone.settings.get_bool(keys::SYNC_PTR).unwrap_or(false);

    // Pre-validate every paired write before touching anything.
    let mut ptr_writes = Vec::new();
    if sync_ptr {
        for rdata in &rrset.data {
            let reverse_owner = reverse_name(rdata)?;
            let reverse_zone = instance.register.find(&reverse_owner).ok_or_else(|| {
                error!(NoPerm => "no reverse zone serves {}", name_text(&reverse_owner))
            })?;
            match validate_ptr(&reverse_zone, &reverse_owner, owner, op)? {
                PtrAction::Skip => {}
                PtrAction::Apply { delete_node } => {
                    ptr_writes.push((reverse_owner, delete_node))
                }
            }
        }
    }

    // Primary write.
    match op {
        UpdateOp::Add => write_rdata(instance, owner, rrset).await?,
        UpdateOp::Delete => remove_rdata(instance, owner, rrset, false).await?,
    }

    // Paired PTR writes; the gate has passed, failures only log. The PTR
    // target is rendered with its trailing dot, the way the schema stores
    // reverse pointers.
    for (reverse_owner, delete_node) in ptr_writes {
        let attribute = record_attribute(Rtype::PTR);
        let value = vec![name_text(owner)];
        let outcome = if delete_node {
            let ptr_set = Rrset::new(Rtype::PTR, rrset.ttl);
            remove_rdata(instance, &reverse_owner, &ptr_set, true).await
        } else {
            match instance.register.dn_for_name(&reverse_owner) {
                Ok(dn) => {
                    let mods = [match op {
                        UpdateOp::Add => Mod::Add(attribute, value),
                        UpdateOp::Delete => Mod::Delete(attribute, value),
                    }];
                    modify_do(instance, &dn, &mods).await
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = outcome {
            log::error!(
                target: "writeback",
                "PTR sync for {} at {} failed: {}",
                name_text(owner),
                name_text(&reverse_owner),
                e
            );
        }
    }

    Ok(())
}
