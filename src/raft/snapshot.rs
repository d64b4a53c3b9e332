use crate::raft::log_store::{RaftLogError, TermIndex};
use crate::raft::membership::Membership;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// State machine image taken at `last_included`, together with the
/// membership in force at that index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included: TermIndex,
    pub membership: Membership,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn index(&self) -> u64 {
        self.last_included.index
    }

    pub fn term(&self) -> u64 {
        self.last_included.term
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    crc: u32,
    snapshot: Snapshot,
}

/// Keeps the latest snapshot in a single file, replaced atomically.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Snapshot>, RaftLogError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: SnapshotFile = serde_json::from_slice(&raw)?;
        if crc32fast::hash(&file.snapshot.data) != file.crc {
            return Err(RaftLogError::Corrupted {
                path: self.path.clone(),
                line: 1,
            });
        }
        Ok(Some(file.snapshot))
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), RaftLogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        let body = serde_json::to_vec(&SnapshotFile {
            crc: crc32fast::hash(&snapshot.data),
            snapshot: snapshot.clone(),
        })?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::membership::ConfChange;
    use crate::types::NodeId;
    use tempfile::TempDir;

    #[test]
    fn save_and_load_latest() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("snapshot.json"));
        assert!(store.load().unwrap().is_none());

        let mut membership = Membership::default();
        membership.apply(&ConfChange::add_node(NodeId::new(1), "mr-1"));
        let snapshot = Snapshot {
            last_included: TermIndex { term: 2, index: 40 },
            membership,
            data: b"state".to_vec(),
        };
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.index(), 40);
    }
}
