//! Append-only ledger of listing ids that must never be processed again.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("reading ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("appending id {id} to ledger {path}: {source}")]
    Append {
        id: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Newline-delimited id store backed by an in-memory set.
///
/// The set is updated before the durable append, so a failed append still prevents
/// a duplicate within the current run.
#[derive(Debug)]
pub struct DedupLedger {
    path: PathBuf,
    ids: HashSet<String>,
    // Set when the store's last line has no terminating newline.
    needs_separator: bool,
}

impl DedupLedger {
    /// Loads every id in the store. A store that does not exist yet is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let (ids, needs_separator) = match fs::read_to_string(&path) {
            Ok(text) => {
                let ids = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string)
                    .collect();
                (ids, !text.is_empty() && !text.ends_with('\n'))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => (HashSet::new(), false),
            Err(source) => return Err(LedgerError::Read { path, source }),
        };
        debug!(path = %path.display(), entries = ids.len(), "loaded dedup ledger");
        Ok(Self {
            path,
            ids,
            needs_separator,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Records `id`. Returns `Ok(false)` without touching disk when it was already known.
    pub fn record(&mut self, id: &str) -> Result<bool, LedgerError> {
        if !self.ids.insert(id.to_string()) {
            return Ok(false);
        }
        self.append(id).map_err(|source| LedgerError::Append {
            id: id.to_string(),
            path: self.path.clone(),
            source,
        })?;
        Ok(true)
    }

    fn append(&mut self, id: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = if self.needs_separator {
            format!("\n{id}\n")
        } else {
            format!("{id}\n")
        };
        file.write_all(line.as_bytes())?;
        self.needs_separator = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let ledger = DedupLedger::load(dir.path().join("scraped_ids.txt")).expect("load");
        assert!(ledger.is_empty());
        assert!(!ledger.contains("1"));
    }

    #[test]
    fn blank_lines_and_repeats_are_tolerated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("scraped_ids.txt");
        fs::write(&path, "101\n\n102\n101\n  103  \n").expect("seed");

        let ledger = DedupLedger::load(&path).expect("load");
        assert_eq!(ledger.len(), 3);
        assert!(ledger.contains("101"));
        assert!(ledger.contains("103"));
    }

    #[test]
    fn recording_twice_appends_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("scraped_ids.txt");
        let mut ledger = DedupLedger::load(&path).expect("load");

        assert!(ledger.record("555").expect("first record"));
        assert!(!ledger.record("555").expect("second record"));
        assert!(ledger.record("556").expect("third record"));

        assert_eq!(fs::read_to_string(&path).expect("read"), "555\n556\n");
        let reloaded = DedupLedger::load(&path).expect("reload");
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn unterminated_last_line_keeps_both_ids() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("scraped_ids.txt");
        fs::write(&path, "100").expect("seed");

        let mut ledger = DedupLedger::load(&path).expect("load");
        assert!(ledger.record("200").expect("record"));
        assert!(ledger.record("201").expect("record again"));

        assert_eq!(fs::read_to_string(&path).expect("read"), "100\n200\n201\n");
        let reloaded = DedupLedger::load(&path).expect("reload");
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains("100"));
        assert!(reloaded.contains("200"));
    }

    #[test]
    fn failed_append_is_reported_but_still_dedups_in_memory() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocked");
        let mut ledger = DedupLedger::load(blocker.join("scraped_ids.txt")).expect("load");
        fs::write(&blocker, "not a directory").expect("create blocker file");

        let err = ledger.record("900").expect_err("append must fail");
        assert!(matches!(err, LedgerError::Append { ref id, .. } if id == "900"));
        assert!(ledger.contains("900"));
        assert!(!ledger.record("900").expect("in-memory hit"));
    }
}
