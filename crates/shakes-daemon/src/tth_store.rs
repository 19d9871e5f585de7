//! Content-addressed TTH store (§4.2): an append-only log of
//! `+T`/`-T` records, periodically compacted to a fresh snapshot, the
//! same durability shape `queue_db.c` uses for `queue2.db`/`slots2.db`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use shakes_core::Tth;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum TthStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TthEntry {
    pub size: u64,
}

/// Guarantees (§4.2): every committed `insert`/`remove` survives a
/// crash between the `write` and the next `compact`, because each
/// call appends a whole record and flushes before returning.
pub struct TthStore {
    log_path: PathBuf,
    log: File,
    entries: HashMap<Tth, TthEntry>,
    /// Records appended since the last compaction; drives when to
    /// compact (a large garbage ratio wastes replay time on restart).
    dirty_records: u64,
}

const COMPACT_THRESHOLD: u64 = 4096;

impl TthStore {
    pub fn open(log_path: &Path) -> Result<Self, TthStoreError> {
        let entries = if log_path.exists() {
            Self::replay(log_path)?
        } else {
            HashMap::new()
        };
        let log = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(Self { log_path: log_path.to_path_buf(), log, entries, dirty_records: 0 })
    }

    fn replay(path: &Path) -> Result<HashMap<Tth, TthEntry>, TthStoreError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            match parts.next() {
                Some("+T") => {
                    let tth_str = parts.next().ok_or_else(|| TthStoreError::Malformed(line.clone()))?;
                    let size_str = parts.next().ok_or_else(|| TthStoreError::Malformed(line.clone()))?;
                    let tth = Tth::parse(tth_str).ok_or_else(|| TthStoreError::Malformed(line.clone()))?;
                    let size: u64 = size_str.parse().map_err(|_| TthStoreError::Malformed(line.clone()))?;
                    entries.insert(tth, TthEntry { size });
                }
                Some("-T") => {
                    let tth_str = parts.next().ok_or_else(|| TthStoreError::Malformed(line.clone()))?;
                    let tth = Tth::parse(tth_str).ok_or_else(|| TthStoreError::Malformed(line.clone()))?;
                    entries.remove(&tth);
                }
                _ => return Err(TthStoreError::Malformed(line)),
            }
        }
        Ok(entries)
    }

    pub fn get(&self, tth: &Tth) -> Option<TthEntry> {
        self.entries.get(tth).copied()
    }

    pub fn contains(&self, tth: &Tth) -> bool {
        self.entries.contains_key(tth)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, tth: Tth, size: u64) -> Result<(), TthStoreError> {
        writeln!(self.log, "+T {} {}", tth.to_base32(), size)?;
        self.log.flush()?;
        self.entries.insert(tth, TthEntry { size });
        self.dirty_records += 1;
        self.maybe_compact()?;
        Ok(())
    }

    pub fn remove(&mut self, tth: &Tth) -> Result<(), TthStoreError> {
        writeln!(self.log, "-T {}", tth.to_base32())?;
        self.log.flush()?;
        self.entries.remove(tth);
        self.dirty_records += 1;
        self.maybe_compact()?;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), TthStoreError> {
        if self.dirty_records < COMPACT_THRESHOLD {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrite the log to hold exactly one `+T` record per live entry,
    /// via write-to-temp-then-rename so a crash mid-compaction leaves
    /// either the old or the new log, never a half-written one.
    pub fn compact(&mut self) -> Result<(), TthStoreError> {
        let tmp_path = self.log_path.with_extension("compact.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (tth, entry) in &self.entries {
                writeln!(tmp, "+T {} {}", tth.to_base32(), entry.size)?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.log_path)?;
        self.log = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        info!("compacted tth store to {} live entries", self.entries.len());
        self.dirty_records = 0;
        Ok(())
    }

    pub fn force_compact_for_test(&mut self) -> Result<(), TthStoreError> {
        self.compact()
    }
}

impl Drop for TthStore {
    fn drop(&mut self) {
        if self.dirty_records > 0 {
            if let Err(e) = self.compact() {
                warn!("failed to compact tth store on shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("tth.log");
        let mut store = TthStore::open(&log_path).unwrap();
        let tth = Tth::from_raw([9; 24]);
        store.insert(tth, 12345).unwrap();
        assert_eq!(store.get(&tth).unwrap().size, 12345);
    }

    #[test]
    fn survives_reopen_without_compaction() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("tth.log");
        let tth = Tth::from_raw([3; 24]);
        {
            let mut store = TthStore::open(&log_path).unwrap();
            store.insert(tth, 999).unwrap();
            std::mem::forget(store); // skip Drop's compaction for this test
        }
        let store = TthStore::open(&log_path).unwrap();
        assert_eq!(store.get(&tth).unwrap().size, 999);
    }

    #[test]
    fn remove_then_reopen_is_gone() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("tth.log");
        let tth = Tth::from_raw([4; 24]);
        {
            let mut store = TthStore::open(&log_path).unwrap();
            store.insert(tth, 1).unwrap();
            store.remove(&tth).unwrap();
        }
        let store = TthStore::open(&log_path).unwrap();
        assert!(!store.contains(&tth));
    }

    #[test]
    fn compact_preserves_live_entries_and_shrinks_log() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("tth.log");
        let mut store = TthStore::open(&log_path).unwrap();
        let a = Tth::from_raw([1; 24]);
        let b = Tth::from_raw([2; 24]);
        store.insert(a, 10).unwrap();
        store.insert(b, 20).unwrap();
        store.remove(&a).unwrap();
        let size_before = std::fs::metadata(&log_path).unwrap().len();
        store.force_compact_for_test().unwrap();
        let size_after = std::fs::metadata(&log_path).unwrap().len();
        assert!(size_after <= size_before);
        assert!(!store.contains(&a));
        assert!(store.contains(&b));
    }
}
