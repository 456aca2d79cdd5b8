//! RR-level diffs between the directory image of a zone and its live
//! database, with the SOA-serial rules that keep write-back echoes
//! idempotent.

use domain::base::iana::Rtype;
use domain::base::{RecordData, Serial, Ttl};
use domain::rdata::{Soa, ZoneRecordData};

use crate::codec::{name_text, DnsName};
use crate::error::Result;
use crate::zone::{Rdata, Rrset, VersionTxn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleOp {
    Del,
    Add,
}

/// A single add-or-delete of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub op: TupleOp,
    pub name: DnsName,
    pub ttl: Ttl,
    pub rdata: Rdata,
}

impl Tuple {
    pub fn rtype(&self) -> Rtype {
        self.rdata.rtype()
    }
}

/// Outcome of the serial pass over a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialPlan {
    /// The diff changes zone data (not merely the serial).
    pub data_changed: bool,
    /// Serial the pass synthesized or rewrote; must be written back to the
    /// directory by the caller.
    pub to_write: Option<Serial>,
}

#[derive(Debug, Clone)]
pub struct Diff {
    origin: DnsName,
    tuples: Vec<Tuple>,
}

impl Diff {
    pub fn new(origin: DnsName) -> Diff {
        Diff {
            origin,
            tuples: Vec::new(),
        }
    }

    /// Builds the minimal diff turning `old` into `desired`.
    pub fn between(
        origin: DnsName,
        old: &[(DnsName, Rrset)],
        desired: &[(DnsName, Rrset)],
    ) -> Diff {
        let mut diff = Diff::new(origin);
        for (name, rrset) in old {
            for rdata in &rrset.data {
                diff.tuples.push(Tuple {
                    op: TupleOp::Del,
                    name: name.clone(),
                    ttl: rrset.ttl,
                    rdata: rdata.clone(),
                });
            }
        }
        for (name, rrset) in desired {
            for rdata in &rrset.data {
                diff.tuples.push(Tuple {
                    op: TupleOp::Add,
                    name: name.clone(),
                    ttl: rrset.ttl,
                    rdata: rdata.clone(),
                });
            }
        }
        diff.minimize();
        diff
    }

    pub fn origin(&self) -> &DnsName {
        &self.origin
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn clear(&mut self) {
        self.tuples.clear();
    }

    /// Removes every DEL/ADD pair naming the same `(owner, ttl, rdata)`:
    /// the applied diff must touch nothing that does not actually change.
    fn minimize(&mut self) {
        let mut keep = vec![true; self.tuples.len()];
        for i in 0..self.tuples.len() {
            if !keep[i] || self.tuples[i].op != TupleOp::Del {
                continue;
            }
            for j in 0..self.tuples.len() {
                if !keep[j] || self.tuples[j].op != TupleOp::Add {
                    continue;
                }
                let (del, add) = (&self.tuples[i], &self.tuples[j]);
                if del.name == add.name && del.ttl == add.ttl && del.rdata == add.rdata {
                    keep[i] = false;
                    keep[j] = false;
                    break;
                }
            }
        }
        let mut index = 0;
        self.tuples.retain(|_| {
            index += 1;
            keep[index - 1]
        });
    }

    fn position(&self, op: TupleOp, rtype: Rtype) -> Option<usize> {
        self.tuples
            .iter()
            .position(|tuple| tuple.op == op && tuple.rtype() == rtype)
    }

    /// Applies the SOA-serial rules.
    ///
    /// `db_soa` is the SOA currently committed in the zone database (absent
    /// only while a fresh zone is first populated); `fresh_zone` marks a
    /// zone created by this very projection; `sync_finished` is false
    /// during the initial refresh.
    pub fn analyze_serial(
        &mut self,
        db_soa: Option<(Ttl, Soa<DnsName>)>,
        fresh_zone: bool,
        sync_finished: bool,
    ) -> Result<SerialPlan> {
        let del_soa = self.position(TupleOp::Del, Rtype::SOA);
        let add_soa = self.position(TupleOp::Add, Rtype::SOA);

        let mut data_changed = fresh_zone
            || !sync_finished
            || self.tuples.iter().any(|tuple| tuple.rtype() != Rtype::SOA);

        // A paired SOA change beyond the serial field is a data change of
        // its own; a serial-only pair is not.
        if let (Some(del), Some(add)) = (del_soa, add_soa) {
            let del = soa_of(&self.tuples[del])?;
            let add = soa_of(&self.tuples[add])?;
            if !soa_eq_ignoring_serial(&del, &add) {
                data_changed = true;
            }
        }

        let old_serial = match del_soa {
            Some(index) => Some(soa_of(&self.tuples[index])?.serial()),
            None => db_soa.as_ref().map(|(_, soa)| soa.serial()),
        };

        if !data_changed {
            // The only surviving possibility is a serial-only pair; absorb
            // it when it would move the serial backward (our own write-back
            // echoed through the directory).
            if let (Some(add), Some(old)) = (add_soa, old_serial) {
                let new = soa_of(&self.tuples[add])?.serial();
                if old > new {
                    log::debug!(
                        target: "diff",
                        "absorbing backward serial {} -> {} for {}",
                        old,
                        new,
                        name_text(&self.origin)
                    );
                    self.clear();
                }
            }
            return Ok(SerialPlan {
                data_changed: false,
                to_write: None,
            });
        }

        match add_soa {
            None => {
                // Data changed without the entry touching the SOA:
                // synthesize the serial bump from the database copy.
                let (ttl, soa) = db_soa.ok_or_else(|| {
                    error!(BadZone => "zone {} has no SOA to bump", name_text(&self.origin))
                })?;
                let new_serial = updated_serial(soa.serial());
                self.tuples.push(Tuple {
                    op: TupleOp::Del,
                    name: self.origin.clone(),
                    ttl,
                    rdata: ZoneRecordData::Soa(soa.clone()),
                });
                self.tuples.push(Tuple {
                    op: TupleOp::Add,
                    name: self.origin.clone(),
                    ttl,
                    rdata: ZoneRecordData::Soa(soa_with_serial(&soa, new_serial)),
                });
                Ok(SerialPlan {
                    data_changed: true,
                    to_write: Some(new_serial),
                })
            }
            Some(add) => {
                let new = soa_of(&self.tuples[add])?.serial();
                let stale = match old_serial {
                    Some(old) => !(new > old),
                    None => true,
                };
                if stale || fresh_zone || !sync_finished {
                    let base = old_serial.unwrap_or(new);
                    let new_serial = updated_serial(base);
                    let soa = soa_of(&self.tuples[add])?;
                    self.tuples[add].rdata =
                        ZoneRecordData::Soa(soa_with_serial(&soa, new_serial));
                    Ok(SerialPlan {
                        data_changed: true,
                        to_write: Some(new_serial),
                    })
                } else {
                    Ok(SerialPlan {
                        data_changed: true,
                        to_write: None,
                    })
                }
            }
        }
    }

    /// Prepends a DEL/ADD SOA pair bumping the serial; used by updates
    /// scoped to a single owner. Returns the new serial.
    pub fn prepend_soa_bump(&mut self, soa_ttl: Ttl, soa: &Soa<DnsName>) -> Serial {
        let new_serial = updated_serial(soa.serial());
        self.tuples.insert(
            0,
            Tuple {
                op: TupleOp::Add,
                name: self.origin.clone(),
                ttl: soa_ttl,
                rdata: ZoneRecordData::Soa(soa_with_serial(soa, new_serial)),
            },
        );
        self.tuples.insert(
            0,
            Tuple {
                op: TupleOp::Del,
                name: self.origin.clone(),
                ttl: soa_ttl,
                rdata: ZoneRecordData::Soa(soa.clone()),
            },
        );
        new_serial
    }

    /// Applies the tuples to an open version.
    pub fn apply(&self, txn: &mut VersionTxn<'_>) -> Result<()> {
        for tuple in &self.tuples {
            match tuple.op {
                TupleOp::Del => txn.del(&tuple.name, &tuple.rdata)?,
                TupleOp::Add => txn.add(&tuple.name, tuple.ttl, tuple.rdata.clone()),
            }
        }
        Ok(())
    }
}

/// Serial under the unix-time update method: the current time when it
/// moves forward, the increment otherwise.
pub fn updated_serial(old: Serial) -> Serial {
    let now = Serial::now();
    if now > old {
        now
    } else {
        old.add(1)
    }
}

fn soa_of(tuple: &Tuple) -> Result<Soa<DnsName>> {
    match &tuple.rdata {
        ZoneRecordData::Soa(soa) => Ok(soa.clone()),
        other => Err(error!(BadZone => "SOA tuple carries {} data", other.rtype())),
    }
}

fn soa_with_serial(soa: &Soa<DnsName>, serial: Serial) -> Soa<DnsName> {
    Soa::new(
        soa.mname().clone(),
        soa.rname().clone(),
        serial,
        soa.refresh(),
        soa.retry(),
        soa.expire(),
        soa.minimum(),
    )
}

fn soa_eq_ignoring_serial(a: &Soa<DnsName>, b: &Soa<DnsName>) -> bool {
    soa_with_serial(a, Serial::from(0)) == soa_with_serial(b, Serial::from(0))
}
