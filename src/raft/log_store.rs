use crate::types::NodeId;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Normal,
    ConfChange,
    /// Appended by a new leader so entries of earlier terms can commit.
    Noop,
}

/// Logical log entry; the payload is opaque to the raft layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftEntry {
    pub term: u64,
    pub index: u64,
    #[serde(default)]
    pub kind: EntryKind,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl RaftEntry {
    pub fn new(term: u64, index: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind,
            data,
        }
    }

    pub fn normal(term: u64, index: u64, data: Vec<u8>) -> Self {
        Self::new(term, index, EntryKind::Normal, data)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermIndex {
    pub term: u64,
    pub index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord {
    /// Position just before the first retained entry.
    Base(TermIndex),
    Entry(RaftEntry),
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    crc: u32,
    record: LogRecord,
}

impl LogLine {
    fn encode(record: LogRecord) -> Result<String, RaftLogError> {
        let body = serde_json::to_vec(&record)?;
        let line = LogLine {
            crc: crc32fast::hash(&body),
            record,
        };
        Ok(serde_json::to_string(&line)?)
    }

    fn verify(&self) -> Result<bool, RaftLogError> {
        let body = serde_json::to_vec(&self.record)?;
        Ok(crc32fast::hash(&body) == self.crc)
    }
}

/// Append-only JSON-lines raft log. Every line carries a CRC32 of its record;
/// compaction rewrites the file behind a `base` marker.
#[derive(Debug)]
pub struct RaftLogStore {
    path: PathBuf,
    base: TermIndex,
    entries: Vec<RaftEntry>,
}

impl RaftLogStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RaftLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (base, entries, torn) = Self::load(&path)?;
        let store = Self {
            path,
            base,
            entries,
        };
        if torn {
            store.rewrite()?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn base(&self) -> TermIndex {
        self.base
    }

    pub fn first_index(&self) -> u64 {
        self.base.index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(self.base.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.term)
            .unwrap_or(self.base.term)
    }

    pub fn entry(&self, index: u64) -> Option<&RaftEntry> {
        if index <= self.base.index {
            return None;
        }
        self.entries.get((index - self.base.index - 1) as usize)
    }

    /// Term of `index`, including the compaction base. `None` means the
    /// position is unknown locally.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base.index {
            return Some(self.base.term);
        }
        self.entry(index).map(|entry| entry.term)
    }

    /// Entries in `[from, to]`, at most `max` of them.
    pub fn entries(&self, from: u64, to: u64, max: usize) -> Vec<RaftEntry> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        let start = (from - self.base.index - 1) as usize;
        let end = (to - self.base.index) as usize;
        self.entries[start..end]
            .iter()
            .take(max.max(1))
            .cloned()
            .collect()
    }

    pub fn append(&mut self, entry: RaftEntry) -> Result<(), RaftLogError> {
        self.append_batch(std::slice::from_ref(&entry))
    }

    pub fn append_batch(&mut self, entries: &[RaftEntry]) -> Result<(), RaftLogError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut expected = self.last_index() + 1;
        let mut last_term = self.last_term();
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index != expected {
                return Err(RaftLogError::NonSequentialAppend {
                    expected,
                    attempted: entry.index,
                });
            }
            if entry.term < last_term {
                return Err(RaftLogError::TermRegression {
                    previous: last_term,
                    attempted: entry.term,
                });
            }
            lines.push(LogLine::encode(LogRecord::Entry(entry.clone()))?);
            expected += 1;
            last_term = entry.term;
        }
        Self::append_lines(&self.path, &lines)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Drops `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), RaftLogError> {
        if index <= self.base.index {
            return Err(RaftLogError::InvalidTruncateIndex {
                index,
                base: self.base.index,
            });
        }
        let keep = (index - self.base.index - 1) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Discards entries up to and including `index`, which must be known.
    pub fn compact_to(&mut self, index: u64) -> Result<(), RaftLogError> {
        if index <= self.base.index {
            return Ok(());
        }
        let term = self
            .term_at(index)
            .ok_or(RaftLogError::CompactBeyondLog {
                index,
                last: self.last_index(),
            })?;
        let drop = (index - self.base.index) as usize;
        self.entries.drain(..drop);
        self.base = TermIndex { term, index };
        self.rewrite()
    }

    /// Replaces the whole log with an empty one positioned at `base`; used
    /// after installing a snapshot that does not match local entries.
    pub fn reset(&mut self, base: TermIndex) -> Result<(), RaftLogError> {
        self.entries.clear();
        self.base = base;
        self.rewrite()
    }

    fn rewrite(&self) -> Result<(), RaftLogError> {
        let tmp = self.path.with_extension("rewrite");
        let mut file = File::create(&tmp)?;
        let base = LogLine::encode(LogRecord::Base(self.base))?;
        file.write_all(base.as_bytes())?;
        file.write_all(b"\n")?;
        for entry in &self.entries {
            let line = LogLine::encode(LogRecord::Entry(entry.clone()))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }

    fn append_lines(path: &Path, lines: &[String]) -> Result<(), RaftLogError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn load(path: &Path) -> Result<(TermIndex, Vec<RaftEntry>, bool), RaftLogError> {
        let mut base = TermIndex::default();
        let mut entries: Vec<RaftEntry> = Vec::new();
        if !path.exists() {
            return Ok((base, entries, false));
        }
        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<Result<Vec<_>, io::Error>>()?;
        let total = lines.len();
        for (number, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(err) if number + 1 == total => {
                    warn!(
                        "event=raft_log_torn_tail path={} line={} error={err}",
                        path.display(),
                        number + 1
                    );
                    return Ok((base, entries, true));
                }
                Err(err) => return Err(err.into()),
            };
            if !parsed.verify()? {
                return Err(RaftLogError::Corrupted {
                    path: path.to_path_buf(),
                    line: number + 1,
                });
            }
            match parsed.record {
                LogRecord::Base(position) => {
                    base = position;
                    entries.clear();
                }
                LogRecord::Entry(entry) => entries.push(entry),
            }
        }
        Ok((base, entries, false))
    }
}

/// Persistent vote state of one raft member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
}

/// JSON-backed hard state written atomically through a temp file.
#[derive(Debug, Clone)]
pub struct HardStateStore {
    path: PathBuf,
}

impl HardStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_default(&self) -> Result<HardState, RaftLogError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(err) => Err(RaftLogError::Io(err)),
        }
    }

    pub fn persist(&self, state: &HardState) -> Result<(), RaftLogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(state)?)?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RaftLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("expected next index {expected}, attempted {attempted}")]
    NonSequentialAppend { expected: u64, attempted: u64 },
    #[error("term regression: previous={previous}, attempted={attempted}")]
    TermRegression { previous: u64, attempted: u64 },
    #[error("truncate index {index} is at or below the compaction base {base}")]
    InvalidTruncateIndex { index: u64, base: u64 },
    #[error("cannot compact to {index}: log ends at {last}")]
    CompactBeyondLog { index: u64, last: u64 },
    #[error("checksum mismatch in {path} at line {line}")]
    Corrupted { path: PathBuf, line: usize },
}
