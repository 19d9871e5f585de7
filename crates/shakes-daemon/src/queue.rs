//! Download queue (§4.4): targets, their known sources, and the
//! append-only journal that survives a restart. Record kinds follow
//! the original `queue_db.c` vocabulary: `+T`/`-T` add/remove a
//! target, `+S`/`-S` add/remove a source, `+F`/`-F` add/remove a
//! filelist request, `+D`/`-D` add/remove a directory download,
//! `=R` records a resume offset, `=P` records a priority change.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use shakes_core::{Nick, Tth};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed journal record: {0}")]
    Malformed(String),
    #[error("unknown target id {0}")]
    UnknownTarget(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Paused,
    Low,
    Normal,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Queued,
    Downloading,
    Complete,
}

#[derive(Clone, Debug)]
pub struct QueueSource {
    pub nick: Nick,
    pub hub_id: u64,
}

#[derive(Clone, Debug)]
pub struct QueueTarget {
    pub id: u64,
    pub tth: Option<Tth>,
    /// Virtual filename as advertised by the source, used for
    /// filename-only (non-TTH) matching against search results.
    pub filename: String,
    pub size: u64,
    pub local_path: PathBuf,
    pub is_directory: bool,
    pub priority: Priority,
    pub resume_offset: u64,
    pub state: TargetState,
    pub sources: Vec<QueueSource>,
}

impl QueueTarget {
    pub fn has_source(&self, nick: &Nick, hub_id: u64) -> bool {
        self.sources.iter().any(|s| &s.nick == nick && s.hub_id == hub_id)
    }
}

pub struct Queue {
    journal_path: PathBuf,
    journal: File,
    targets: HashMap<u64, QueueTarget>,
    next_id: u64,
}

impl Queue {
    pub fn open(journal_path: &Path) -> Result<Self, QueueError> {
        let targets = if journal_path.exists() {
            Self::replay(journal_path)?
        } else {
            HashMap::new()
        };
        let next_id = targets.keys().max().map(|id| id + 1).unwrap_or(0);
        let journal = OpenOptions::new().create(true).append(true).open(journal_path)?;
        Ok(Self { journal_path: journal_path.to_path_buf(), journal, targets, next_id })
    }

    fn replay(path: &Path) -> Result<HashMap<u64, QueueTarget>, QueueError> {
        let reader = BufReader::new(File::open(path)?);
        let mut targets: HashMap<u64, QueueTarget> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(2, ' ');
            let kind = fields.next().unwrap_or("");
            let rest = fields.next().unwrap_or("");
            match kind {
                "+T" => {
                    let mut p = rest.splitn(6, '\t');
                    let id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let tth_field = p.next().unwrap_or("-");
                    let tth = if tth_field == "-" { None } else { Tth::parse(tth_field) };
                    let filename = p.next().unwrap_or("").to_string();
                    let size: u64 = p.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let local_path = PathBuf::from(p.next().unwrap_or(""));
                    let is_directory = p.next() == Some("dir");
                    targets.insert(id, QueueTarget {
                        id, tth, filename, size, local_path, is_directory,
                        priority: Priority::Normal, resume_offset: 0,
                        state: TargetState::Queued, sources: Vec::new(),
                    });
                }
                "-T" => {
                    let id: u64 = rest.parse().map_err(|_| QueueError::Malformed(line.clone()))?;
                    targets.remove(&id);
                }
                "+S" => {
                    let mut p = rest.splitn(3, '\t');
                    let id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let hub_id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let nick = Nick::new(p.next().unwrap_or(""));
                    if let Some(t) = targets.get_mut(&id) {
                        if !t.has_source(&nick, hub_id) {
                            t.sources.push(QueueSource { nick, hub_id });
                        }
                    }
                }
                "-S" => {
                    let mut p = rest.splitn(3, '\t');
                    let id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let hub_id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let nick = Nick::new(p.next().unwrap_or(""));
                    if let Some(t) = targets.get_mut(&id) {
                        t.sources.retain(|s| !(s.nick == nick && s.hub_id == hub_id));
                    }
                }
                "=R" => {
                    let mut p = rest.splitn(2, '\t');
                    let id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let offset: u64 = p.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    if let Some(t) = targets.get_mut(&id) {
                        t.resume_offset = offset;
                    }
                }
                "=P" => {
                    let mut p = rest.splitn(2, '\t');
                    let id: u64 = p.next().and_then(|s| s.parse().ok()).ok_or_else(|| QueueError::Malformed(line.clone()))?;
                    let prio = match p.next() {
                        Some("paused") => Priority::Paused,
                        Some("low") => Priority::Low,
                        Some("high") => Priority::High,
                        _ => Priority::Normal,
                    };
                    if let Some(t) = targets.get_mut(&id) {
                        t.priority = prio;
                    }
                }
                _ => return Err(QueueError::Malformed(line)),
            }
        }
        Ok(targets)
    }

    fn append(&mut self, line: &str) -> Result<(), QueueError> {
        writeln!(self.journal, "{}", line)?;
        self.journal.flush()?;
        Ok(())
    }

    /// Add a new target. Per §4.4's insertion rule, a target already
    /// queued by TTH is not duplicated — the caller's new source is
    /// merged into the existing target instead.
    pub fn add_target(
        &mut self,
        tth: Option<Tth>,
        filename: String,
        size: u64,
        local_path: PathBuf,
        is_directory: bool,
    ) -> u64 {
        if let Some(tth) = tth {
            if let Some(existing) = self.targets.values().find(|t| t.tth == Some(tth)) {
                return existing.id;
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        let tth_field = tth.map(|t| t.to_base32()).unwrap_or_else(|| "-".to_string());
        let dir_field = if is_directory { "dir" } else { "file" };
        let _ = self.append(&format!(
            "+T {}\t{}\t{}\t{}\t{}\t{}",
            id, tth_field, filename, size, local_path.display(), dir_field
        ));
        self.targets.insert(id, QueueTarget {
            id, tth, filename, size, local_path, is_directory,
            priority: Priority::Normal, resume_offset: 0,
            state: TargetState::Queued, sources: Vec::new(),
        });
        id
    }

    pub fn remove_target(&mut self, id: u64) -> Result<(), QueueError> {
        if self.targets.remove(&id).is_none() {
            return Err(QueueError::UnknownTarget(id));
        }
        self.append(&format!("-T {}", id))
    }

    pub fn add_source(&mut self, id: u64, hub_id: u64, nick: Nick) -> Result<(), QueueError> {
        let target = self.targets.get_mut(&id).ok_or(QueueError::UnknownTarget(id))?;
        if target.has_source(&nick, hub_id) {
            return Ok(());
        }
        target.sources.push(QueueSource { nick: nick.clone(), hub_id });
        self.append(&format!("+S {}\t{}\t{}", id, hub_id, nick.as_str()))
    }

    pub fn remove_source(&mut self, id: u64, hub_id: u64, nick: &Nick) -> Result<(), QueueError> {
        let target = self.targets.get_mut(&id).ok_or(QueueError::UnknownTarget(id))?;
        target.sources.retain(|s| !(s.nick == *nick && s.hub_id == hub_id));
        self.append(&format!("-S {}\t{}\t{}", id, hub_id, nick.as_str()))
    }

    pub fn set_priority(&mut self, id: u64, priority: Priority) -> Result<(), QueueError> {
        let target = self.targets.get_mut(&id).ok_or(QueueError::UnknownTarget(id))?;
        target.priority = priority;
        let label = match priority {
            Priority::Paused => "paused",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        self.append(&format!("=P {}\t{}", id, label))
    }

    pub fn record_resume_offset(&mut self, id: u64, offset: u64) -> Result<(), QueueError> {
        let target = self.targets.get_mut(&id).ok_or(QueueError::UnknownTarget(id))?;
        target.resume_offset = offset;
        self.append(&format!("=R {}\t{}", id, offset))
    }

    pub fn get(&self, id: u64) -> Option<&QueueTarget> {
        self.targets.get(&id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &QueueTarget> {
        self.targets.values()
    }

    /// Selection algorithm (§4.4): among queued (non-paused) targets
    /// with at least one source not already downloading elsewhere,
    /// pick the highest-priority one; break ties by lowest id (oldest
    /// request first).
    pub fn select_next(&self, busy_sources: &[(Nick, u64)]) -> Option<(&QueueTarget, &QueueSource)> {
        let mut best: Option<(&QueueTarget, &QueueSource)> = None;
        for target in self.targets.values() {
            if target.state != TargetState::Queued || target.priority == Priority::Paused {
                continue;
            }
            for source in &target.sources {
                if busy_sources.iter().any(|(n, h)| n == &source.nick && *h == source.hub_id) {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_target, _)) => {
                        target.priority > best_target.priority
                            || (target.priority == best_target.priority && target.id < best_target.id)
                    }
                };
                if better {
                    best = Some((target, source));
                }
            }
        }
        best
    }

    pub fn mark_downloading(&mut self, id: u64) {
        if let Some(t) = self.targets.get_mut(&id) {
            t.state = TargetState::Downloading;
        }
    }

    pub fn mark_queued(&mut self, id: u64) {
        if let Some(t) = self.targets.get_mut(&id) {
            t.state = TargetState::Queued;
        }
    }

    pub fn mark_complete(&mut self, id: u64) {
        if let Some(t) = self.targets.get_mut(&id) {
            t.state = TargetState::Complete;
        }
    }

    /// Targets still missing every piece of source information needed
    /// to be downloadable — candidates for the periodic auto-search
    /// (§4.4, 123s timer; the timer itself lives in `daemon.rs`).
    pub fn needs_auto_search(&self) -> impl Iterator<Item = &QueueTarget> {
        self.targets.values().filter(|t| t.sources.is_empty() && t.state == TargetState::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn journal() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        (dir, path)
    }

    #[test]
    fn add_target_dedupes_by_tth() {
        let (_dir, path) = journal();
        let mut queue = Queue::open(&path).unwrap();
        let tth = Tth::from_raw([5; 24]);
        let id1 = queue.add_target(Some(tth), "a.bin".into(), 100, "/dl/a.bin".into(), false);
        let id2 = queue.add_target(Some(tth), "a.bin".into(), 100, "/dl/a.bin".into(), false);
        assert_eq!(id1, id2);
        assert_eq!(queue.targets().count(), 1);
    }

    #[test]
    fn select_next_prefers_higher_priority() {
        let (_dir, path) = journal();
        let mut queue = Queue::open(&path).unwrap();
        let low = queue.add_target(None, "low.bin".into(), 10, "/dl/low.bin".into(), false);
        let high = queue.add_target(None, "high.bin".into(), 10, "/dl/high.bin".into(), false);
        queue.add_source(low, 1, Nick::new("alice")).unwrap();
        queue.add_source(high, 1, Nick::new("bob")).unwrap();
        queue.set_priority(high, Priority::High).unwrap();

        let (target, _source) = queue.select_next(&[]).unwrap();
        assert_eq!(target.id, high);
    }

    #[test]
    fn select_next_skips_busy_sources() {
        let (_dir, path) = journal();
        let mut queue = Queue::open(&path).unwrap();
        let id = queue.add_target(None, "a.bin".into(), 10, "/dl/a.bin".into(), false);
        queue.add_source(id, 1, Nick::new("alice")).unwrap();
        let busy = [(Nick::new("alice"), 1)];
        assert!(queue.select_next(&busy).is_none());
    }

    #[test]
    fn journal_replays_targets_sources_and_priority() {
        let (_dir, path) = journal();
        let id;
        {
            let mut queue = Queue::open(&path).unwrap();
            id = queue.add_target(None, "a.bin".into(), 42, "/dl/a.bin".into(), false);
            queue.add_source(id, 7, Nick::new("carol")).unwrap();
            queue.set_priority(id, Priority::High).unwrap();
            queue.record_resume_offset(id, 1024).unwrap();
        }
        let queue = Queue::open(&path).unwrap();
        let target = queue.get(id).unwrap();
        assert_eq!(target.sources.len(), 1);
        assert_eq!(target.priority, Priority::High);
        assert_eq!(target.resume_offset, 1024);
    }

    #[test]
    fn paused_targets_are_never_selected() {
        let (_dir, path) = journal();
        let mut queue = Queue::open(&path).unwrap();
        let id = queue.add_target(None, "a.bin".into(), 10, "/dl/a.bin".into(), false);
        queue.add_source(id, 1, Nick::new("alice")).unwrap();
        queue.set_priority(id, Priority::Paused).unwrap();
        assert!(queue.select_next(&[]).is_none());
    }

    #[test]
    fn needs_auto_search_finds_sourceless_targets() {
        let (_dir, path) = journal();
        let mut queue = Queue::open(&path).unwrap();
        queue.add_target(None, "orphan.bin".into(), 10, "/dl/orphan.bin".into(), false);
        assert_eq!(queue.needs_auto_search().count(), 1);
    }
}
