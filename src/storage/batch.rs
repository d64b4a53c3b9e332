use crate::storage::codec::{encode_commit_key, encode_data_key, COMMIT_CONTEXT_KEY};
use crate::storage::commit_context::CommitContext;
use crate::storage::error::StorageError;
use crate::storage::Storage;
use crate::types::{Glsn, Llsn};

/// Buffers `(llsn, payload)` pairs for the data column.
pub struct WriteBatch<'a> {
    storage: &'a Storage,
    batch: rocksdb::WriteBatch,
    len: usize,
}

impl<'a> WriteBatch<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            batch: rocksdb::WriteBatch::default(),
            len: 0,
        }
    }

    pub fn set(&mut self, llsn: Llsn, data: &[u8]) {
        self.batch.put(encode_data_key(llsn), data);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn apply(self) -> Result<(), StorageError> {
        self.storage
            .data_db()
            .write_opt(self.batch, &self.storage.write_options())?;
        Ok(())
    }
}

/// Buffers `(glsn -> llsn)` index entries. The commit context given at
/// creation is written in the same atomic unit.
pub struct CommitBatch<'a> {
    storage: &'a Storage,
    batch: rocksdb::WriteBatch,
    len: usize,
}

impl<'a> CommitBatch<'a> {
    pub(crate) fn new(storage: &'a Storage, cc: &CommitContext) -> Self {
        let mut batch = rocksdb::WriteBatch::default();
        batch.put(COMMIT_CONTEXT_KEY, cc.encode());
        Self {
            storage,
            batch,
            len: 0,
        }
    }

    pub fn set(&mut self, glsn: Glsn, llsn: Llsn) {
        self.batch.put(encode_commit_key(glsn), encode_data_key(llsn));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn apply(self) -> Result<(), StorageError> {
        self.storage
            .commit_db()
            .write_opt(self.batch, &self.storage.write_options())?;
        Ok(())
    }
}

/// Writes a payload together with its commit index, and optionally a commit
/// context. With separated stores the data half is persisted first so that a
/// crash can only leave data without an index, never the reverse.
pub struct AppendBatch<'a> {
    storage: &'a Storage,
    data: rocksdb::WriteBatch,
    commit: Option<rocksdb::WriteBatch>,
    len: usize,
}

impl<'a> AppendBatch<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        let commit = storage.is_separate().then(rocksdb::WriteBatch::default);
        Self {
            storage,
            data: rocksdb::WriteBatch::default(),
            commit,
            len: 0,
        }
    }

    pub fn set_log_entry(&mut self, llsn: Llsn, glsn: Glsn, data: &[u8]) {
        let dk = encode_data_key(llsn);
        self.data.put(dk, data);
        self.commit_batch().put(encode_commit_key(glsn), dk);
        self.len += 1;
    }

    pub fn set_commit_context(&mut self, cc: &CommitContext) {
        self.commit_batch().put(COMMIT_CONTEXT_KEY, cc.encode());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn apply(self) -> Result<(), StorageError> {
        let opts = self.storage.write_options();
        if !self.data.is_empty() {
            self.storage.data_db().write_opt(self.data, &opts)?;
        }
        if let Some(commit) = self.commit {
            if !commit.is_empty() {
                self.storage.commit_db().write_opt(commit, &opts)?;
            }
        }
        Ok(())
    }

    fn commit_batch(&mut self) -> &mut rocksdb::WriteBatch {
        match self.commit.as_mut() {
            Some(commit) => commit,
            None => &mut self.data,
        }
    }
}
