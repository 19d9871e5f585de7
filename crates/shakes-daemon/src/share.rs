//! Share index and scanner (§4.1).
//!
//! The index maps virtual roots to local directories and tracks every
//! shared file's [`CompositeInode`] so a rescan can tell, without
//! re-hashing, whether a file is unchanged (case b), modified (case c)
//! or gone (case d) since the last scan. The scan itself is cooperative:
//! [`ShareIndex::scan_tick`] walks at most a handful of directories per
//! call so a daemon reactor can interleave it with everything else
//! instead of blocking on a full tree walk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use shakes_core::{CompositeInode, Tth, VirtualRoot};
use tracing::warn;

use crate::bloom::{split_words, ShareBloom};

/// §4.1: "a cooperative worker processes directories in batches of
/// five per tick."
pub const SCAN_BATCH_DIRS: usize = 5;

#[derive(Clone, Debug)]
pub struct ShareFile {
    pub virtual_root: String,
    /// Relative path under the mountpoint, `/`-separated.
    pub rel_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub inode: CompositeInode,
    pub tth: Option<Tth>,
}

impl ShareFile {
    pub fn virtual_path(&self) -> String {
        shakes_core::path::to_virtual_path(&self.virtual_root, &self.rel_path)
    }

    pub fn needs_hashing(&self) -> bool {
        self.tth.is_none()
    }

    fn basename(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }
}

/// Outcome of comparing one scan pass against the previous index
/// state, for the §4.1 case a-d bookkeeping.
#[derive(Default, Debug)]
pub struct ScanReport {
    pub added: Vec<CompositeInode>,
    pub unchanged: Vec<CompositeInode>,
    pub changed: Vec<CompositeInode>,
    pub removed: Vec<CompositeInode>,
    /// Case e: a second mountpoint path resolved to the same
    /// underlying file (same device+inode); we keep the first
    /// registration and skip the duplicate rather than share one
    /// `CompositeInode` between two virtual paths.
    pub duplicates_skipped: Vec<PathBuf>,
}

struct ScanState {
    pending: VecDeque<(String, PathBuf, String)>,
    present: HashSet<CompositeInode>,
    report: ScanReport,
}

#[derive(Default)]
pub struct ShareIndex {
    roots: HashMap<String, PathBuf>,
    files: HashMap<CompositeInode, ShareFile>,
    seen_real_inodes: HashMap<(u64, u64), CompositeInode>,
    bloom: ShareBloom,
    scan: Option<ScanState>,
}

impl ShareIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mountpoint, deriving its virtual root label from the
    /// directory basename and de-duplicating on collision with `-N`
    /// (§3). Does not scan by itself; call [`ShareIndex::start_scan`]
    /// (or wait for the periodic rescan) to populate it.
    pub fn add_mountpoint(&mut self, local_dir: &Path) -> String {
        let basename = local_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "share".to_string());
        let mut label = VirtualRoot::sanitize(&basename);
        let mut n = 1;
        while self.roots.contains_key(&label) {
            n += 1;
            label = format!("{}-{}", VirtualRoot::sanitize(&basename), n);
        }
        self.roots.insert(label.clone(), local_dir.to_path_buf());
        label
    }

    pub fn roots(&self) -> &HashMap<String, PathBuf> {
        &self.roots
    }

    /// Drop a mountpoint and every file indexed under it. Returns
    /// `false` if the label wasn't registered.
    pub fn remove_mountpoint(&mut self, label: &str) -> bool {
        if self.roots.remove(label).is_none() {
            return false;
        }
        let gone: Vec<CompositeInode> = self
            .files
            .values()
            .filter(|f| f.virtual_root == label)
            .map(|f| f.inode)
            .collect();
        for inode in gone {
            self.files.remove(&inode);
        }
        self.seen_real_inodes.retain(|_, inode| self.files.contains_key(inode));
        true
    }

    pub fn get(&self, inode: &CompositeInode) -> Option<&ShareFile> {
        self.files.get(inode)
    }

    /// Stamp a hash result onto the indexed file and index its
    /// basename into the Bloom filter — the point at which §4.1 says a
    /// file becomes "already hashed ... added to the hashed set and
    /// Bloom filter."
    pub fn set_tth(&mut self, inode: &CompositeInode, tth: Tth) {
        let basename = self.files.get(inode).map(|f| f.basename().to_string());
        if let Some(file) = self.files.get_mut(inode) {
            file.tth = Some(tth);
        }
        if let Some(name) = basename {
            self.bloom.add_filename(&name);
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &ShareFile> {
        self.files.values()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    pub fn bloom(&self) -> &ShareBloom {
        &self.bloom
    }

    pub fn scan_in_progress(&self) -> bool {
        self.scan.is_some()
    }

    /// Begin (or continue, if already running) a full reconciliation
    /// pass over every registered mountpoint. Safe to call repeatedly;
    /// a scan already in flight is left untouched.
    pub fn start_scan(&mut self) {
        if self.scan.is_some() {
            return;
        }
        let pending = self
            .roots
            .iter()
            .map(|(label, root)| (label.clone(), root.clone(), String::new()))
            .collect();
        self.scan = Some(ScanState { pending, present: HashSet::new(), report: ScanReport::default() });
    }

    /// Advance an in-progress scan by at most `max_dirs` directories.
    /// Returns `None` while the scan is still running (or none is
    /// active), and `Some(report)` the tick the walk completes —
    /// including stale-file removal. Symlinks are not followed (avoids
    /// share-escape and cycles); hidden entries, names containing
    /// protocol-reserved `$`/`|`, and zero-byte files are skipped.
    pub fn scan_tick(&mut self, max_dirs: usize) -> Option<ScanReport> {
        if self.scan.is_none() {
            return None;
        }

        for _ in 0..max_dirs {
            let next = self.scan.as_mut().and_then(|s| s.pending.pop_front());
            let Some((label, dir, rel_prefix)) = next else { break };
            self.scan_one_dir(&label, &dir, &rel_prefix);
        }

        let done = matches!(&self.scan, Some(state) if state.pending.is_empty());
        if !done {
            return None;
        }

        let state = self.scan.take().expect("checked Some above");
        let mut report = state.report;
        let stale: Vec<CompositeInode> =
            self.files.keys().filter(|k| !state.present.contains(*k)).copied().collect();
        for inode in &stale {
            self.files.remove(inode);
        }
        self.seen_real_inodes.retain(|_, inode| !stale.contains(inode));
        report.removed.extend(stale);
        Some(report)
    }

    fn scan_one_dir(&mut self, label: &str, dir: &Path, rel_prefix: &str) {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot read share directory {:?}: {}", dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str.starts_with('.') || name_str.contains('$') || name_str.contains('|') {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let path = entry.path();
            let rel = if rel_prefix.is_empty() {
                name_str.to_string()
            } else {
                format!("{}/{}", rel_prefix, name_str)
            };

            if meta.is_dir() {
                if let Some(state) = &mut self.scan {
                    state.pending.push_back((label.to_string(), path, rel));
                }
                continue;
            }
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }

            let real_key = (meta.dev(), meta.ino());
            if let Some(existing) = self.seen_real_inodes.get(&real_key).copied() {
                let already_present = matches!(&self.scan, Some(s) if s.present.contains(&existing));
                if already_present {
                    if let Some(state) = &mut self.scan {
                        state.report.duplicates_skipped.push(path);
                    }
                    continue;
                }
            }

            let inode = CompositeInode::new(meta.len(), meta.ino());
            if let Some(state) = &mut self.scan {
                state.present.insert(inode);
            }
            self.seen_real_inodes.insert(real_key, inode);

            match self.files.get(&inode) {
                Some(existing) => {
                    if existing.tth.is_some() {
                        self.bloom.add_filename(&name_str);
                    }
                    if let Some(state) = &mut self.scan {
                        state.report.unchanged.push(inode);
                    }
                }
                None => {
                    let replaced_path_only =
                        self.files.values().any(|f| f.virtual_root == label && f.rel_path == rel);
                    self.files.insert(
                        inode,
                        ShareFile {
                            virtual_root: label.to_string(),
                            rel_path: rel,
                            local_path: path,
                            size: meta.len(),
                            inode,
                            tth: None,
                        },
                    );
                    if let Some(state) = &mut self.scan {
                        let bucket =
                            if replaced_path_only { &mut state.report.changed } else { &mut state.report.added };
                        bucket.push(inode);
                    }
                }
            }
        }
    }

    /// Incoming-search matcher (§4.7): a TTH query is a direct lookup;
    /// a name query first asks the Bloom filter whether every word
    /// could possibly be present, short-circuiting the whole share
    /// with no linear scan when it can't.
    pub fn search(&self, pattern: &str, min_size: Option<u64>, max_size: Option<u64>, tth: Option<Tth>) -> Vec<&ShareFile> {
        if let Some(tth) = tth {
            return self.files.values().filter(|f| f.tth == Some(tth)).collect();
        }

        let words = split_words(pattern);
        if !words.is_empty() && !self.bloom.may_match(&words) {
            return Vec::new();
        }

        self.files
            .values()
            .filter(|f| f.tth.is_some())
            .filter(|f| {
                let name = f.basename().to_lowercase();
                words.iter().all(|w| name.contains(w.as_str()))
            })
            .filter(|f| min_size.map(|min| f.size >= min).unwrap_or(true))
            .filter(|f| max_size.map(|max| f.size <= max).unwrap_or(true))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn run_scan(index: &mut ShareIndex) -> ScanReport {
        index.start_scan();
        loop {
            if let Some(report) = index.scan_tick(100) {
                return report;
            }
        }
    }

    #[test]
    fn add_mountpoint_dedupes_labels() {
        let mut index = ShareIndex::new();
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        // Force identical basenames by renaming into same-name children.
        let dir_a = a.path().join("music");
        let dir_b = b.path().join("music");
        fs::create_dir(&dir_a).unwrap();
        fs::create_dir(&dir_b).unwrap();
        let label_a = index.add_mountpoint(&dir_a);
        let label_b = index.add_mountpoint(&dir_b);
        assert_eq!(label_a, "music");
        assert_eq!(label_b, "music-2");
    }

    #[test]
    fn scan_detects_new_unchanged_and_removed_files() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        fs::write(&file_path, b"hello").unwrap();
        index.add_mountpoint(dir.path());

        let first = run_scan(&mut index);
        assert_eq!(first.added.len(), 1);
        assert!(first.removed.is_empty());

        let second = run_scan(&mut index);
        assert_eq!(second.unchanged.len(), 1);
        assert!(second.added.is_empty());

        fs::remove_file(&file_path).unwrap();
        let third = run_scan(&mut index);
        assert_eq!(third.removed.len(), 1);
    }

    #[test]
    fn scan_is_cooperative_across_multiple_directories() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        for n in 0..12 {
            let sub = dir.path().join(format!("sub{n}"));
            fs::create_dir(&sub).unwrap();
            fs::write(sub.join("f.bin"), b"x").unwrap();
        }
        index.add_mountpoint(dir.path());
        index.start_scan();

        // One dir for the root + 12 subdirs = 13 dirs total; batches of
        // 5 means it can't finish in a single tick.
        assert!(index.scan_tick(SCAN_BATCH_DIRS).is_none());
        assert!(index.scan_in_progress());

        let mut report = None;
        for _ in 0..10 {
            if let Some(r) = index.scan_tick(SCAN_BATCH_DIRS) {
                report = Some(r);
                break;
            }
        }
        let report = report.expect("scan should finish within a few ticks");
        assert_eq!(report.added.len(), 12);
        assert!(!index.scan_in_progress());
    }

    #[test]
    fn scan_detects_content_change_via_composite_inode() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        fs::write(&file_path, b"hello").unwrap();
        index.add_mountpoint(dir.path());
        let first = run_scan(&mut index);
        let inode = first.added[0];
        index.set_tth(&inode, Tth::from_raw([1; 24]));

        fs::write(&file_path, b"hello world, now longer").unwrap();
        let second = run_scan(&mut index);
        assert_eq!(second.changed.len(), 1);
        let new_file = index.get(&second.changed[0]).unwrap();
        assert!(new_file.needs_hashing());
    }

    #[test]
    fn scan_skips_dotfiles_and_zero_byte_files() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();
        fs::write(dir.path().join("empty.bin"), b"").unwrap();
        index.add_mountpoint(dir.path());
        let report = run_scan(&mut index);
        assert!(report.added.is_empty());
    }

    #[test]
    fn set_tth_indexes_filename_into_bloom() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("report.pdf"), b"hello").unwrap();
        index.add_mountpoint(dir.path());
        let report = run_scan(&mut index);
        let inode = report.added[0];
        index.set_tth(&inode, Tth::from_raw([7; 24]));
        assert!(index.bloom().may_match(&["report".to_string()]));
    }

    #[test]
    fn search_short_circuits_when_bloom_proves_absence() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("report.pdf"), b"hello").unwrap();
        index.add_mountpoint(dir.path());
        let report = run_scan(&mut index);
        index.set_tth(&report.added[0], Tth::from_raw([7; 24]));

        assert_eq!(index.search("report", None, None, None).len(), 1);
        assert!(index.search("xenomorphic", None, None, None).is_empty());
    }

    #[test]
    fn search_by_tth_bypasses_bloom() {
        let mut index = ShareIndex::new();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"hello").unwrap();
        index.add_mountpoint(dir.path());
        let report = run_scan(&mut index);
        let tth = Tth::from_raw([9; 24]);
        index.set_tth(&report.added[0], tth);
        assert_eq!(index.search("", None, None, Some(tth)).len(), 1);
    }
}
