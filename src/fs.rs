//! On-disk layout of projected zones:
//! `<directory>/master/<filesafe-name>/{raw,journal,keys/}`. The raw file
//! and journal are (re)materialized from the directory; `keys/` belongs to
//! the host's signing machinery and is only ever created, never touched.

use std::io::Write;
use std::path::{Path, PathBuf};

use domain::base::RecordData;

use crate::codec::{self, name_text, DnsName};
use crate::error::Result;
use crate::zone::ZoneDb;

pub const MASTER_DIR: &str = "master";
pub const RAW_FILE: &str = "raw";
pub const JOURNAL_FILE: &str = "journal";
pub const KEYS_DIR: &str = "keys";

#[derive(Debug, Clone)]
pub struct ZonePaths {
    pub dir: PathBuf,
    pub raw: PathBuf,
    pub journal: PathBuf,
    pub keys: PathBuf,
}

pub fn zone_paths(data_dir: &Path, origin: &DnsName) -> Result<ZonePaths> {
    let dir = data_dir.join(MASTER_DIR).join(codec::filesafe_name(origin)?);
    Ok(ZonePaths {
        raw: dir.join(RAW_FILE),
        journal: dir.join(JOURNAL_FILE),
        keys: dir.join(KEYS_DIR),
        dir,
    })
}

/// Sets a zone's directory up for a fresh projection: the raw file is
/// removed (it will be rewritten from the directory), the journal and the
/// keys directory are left to accumulate.
pub fn prepare_zone_dir(paths: &ZonePaths) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)?;
    std::fs::create_dir_all(&paths.keys)?;
    if paths.raw.is_file() {
        std::fs::remove_file(&paths.raw)?;
    }
    if !paths.journal.is_file() {
        std::fs::File::create(&paths.journal)?;
    }
    Ok(())
}

/// Removes everything a zone left on disk.
pub fn remove_zone_dir(paths: &ZonePaths) -> Result<()> {
    if paths.dir.is_dir() {
        std::fs::remove_dir_all(&paths.dir)?;
    }
    Ok(())
}

/// Drops stale raw files for the named zones; run before the consumer
/// reopens its stream so a half-written file never survives a restart.
pub fn sweep_stale_files(data_dir: &Path, origins: &[DnsName]) -> Result<()> {
    for origin in origins {
        let paths = zone_paths(data_dir, origin)?;
        if paths.raw.is_file() {
            log::debug!(
                target: "fs",
                "removing stale zone file {}",
                paths.raw.display()
            );
            std::fs::remove_file(&paths.raw)?;
        }
    }
    Ok(())
}

/// Writes the zone's current contents in master-file form.
pub fn write_zone_file(paths: &ZonePaths, db: &ZoneDb) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)?;

    let snapshot = db.read();
    let mut text = String::new();
    // SOA first, then everything else in canonical order.
    if let Some((ttl, soa)) = snapshot.soa(db.apex()) {
        text.push_str(&format!(
            "{} {} IN SOA {}\n",
            name_text(db.apex()),
            ttl.as_secs(),
            soa
        ));
    }
    for (owner, rrset) in snapshot.all() {
        for rdata in &rrset.data {
            if rdata.rtype() == domain::base::iana::Rtype::SOA {
                continue;
            }
            text.push_str(&format!(
                "{} {} IN {} {}\n",
                name_text(owner),
                rrset.ttl.as_secs(),
                rrset.rtype,
                rdata
            ));
        }
    }

    let mut file = std::fs::File::create(&paths.raw)?;
    file.write_all(text.as_bytes())?;
    log::debug!(target: "fs", "wrote zone file {}", paths.raw.display());
    Ok(())
}
