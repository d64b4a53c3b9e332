use crate::config::ConfigError;
use crate::types::{Glsn, Llsn};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage: no log entry")]
    NoLogEntry,
    #[error("storage: no commit context")]
    NoCommitContext,
    #[error("storage: inconsistent write and commit (glsn={glsn} points to missing llsn={llsn})")]
    InconsistentWriteCommitState { glsn: Glsn, llsn: Llsn },
    #[error("storage: unexpected uncommitted begin, expected {expected} but got {found}")]
    UnexpectedUncommittedBegin { expected: Llsn, found: Llsn },
    #[error("storage: invalid layout at {path}: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage engine error: {0}")]
    Engine(#[from] rocksdb::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NoLogEntry | StorageError::NoCommitContext
        )
    }
}
