//! Append-only per-zone change journals. Every applied transaction is
//! recorded as its tuples so the host can serve incremental transfers from
//! it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::name_text;
use crate::diff::{Diff, TupleOp};
use crate::error::Result;

const TXN_BEGIN: &str = ";BEGIN";
const TXN_END: &str = ";END";

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Journal> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Touch the file so the host sees the journal as soon as the zone
        // exists.
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one transaction. Empty diffs are not recorded.
    pub fn append(&self, diff: &Diff) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }

        let mut text = String::new();
        text.push_str(TXN_BEGIN);
        text.push('\n');
        for tuple in diff.tuples() {
            let op = match tuple.op {
                TupleOp::Del => "del",
                TupleOp::Add => "add",
            };
            text.push_str(&format!(
                "{} {} {} IN {} {}\n",
                op,
                name_text(&tuple.name),
                tuple.ttl.as_secs(),
                tuple.rtype(),
                tuple.rdata
            ));
        }
        text.push_str(TXN_END);
        text.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(text.as_bytes())?;
        log::debug!(
            target: "journal",
            "{}: wrote transaction of {} tuples",
            self.path.display(),
            diff.tuples().len()
        );
        Ok(())
    }

    /// Number of recorded transactions.
    pub fn transactions(&self) -> Result<usize> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(text.lines().filter(|line| *line == TXN_BEGIN).count())
    }
}
