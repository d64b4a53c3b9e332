use crate::proto::LogEntry;
use crate::storage::codec::{
    decode_commit_key, decode_data_key, encode_commit_key, encode_data_key,
};
use crate::storage::error::StorageError;
use crate::storage::Storage;
use crate::types::{Glsn, Llsn};
use rocksdb::{DBRawIterator, ReadOptions};

/// Half-open key range for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRange {
    /// Committed entries with `begin <= glsn < end`.
    Glsn { begin: Glsn, end: Glsn },
    /// Stored entries with `begin <= llsn < end`, committed or not. Entries
    /// produced this way carry an invalid GLSN.
    Llsn { begin: Llsn, end: Llsn },
}

/// Lazily advancing cursor over one column. Yields entries in key order; an
/// inconsistency is yielded once as an error and ends the scan.
pub struct Scanner<'a> {
    storage: &'a Storage,
    range: ScanRange,
    iter: DBRawIterator<'a>,
    done: bool,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(storage: &'a Storage, range: ScanRange) -> Self {
        let mut opts = ReadOptions::default();
        let db = match range {
            ScanRange::Glsn { begin, end } => {
                opts.set_iterate_lower_bound(encode_commit_key(begin).to_vec());
                opts.set_iterate_upper_bound(encode_commit_key(end).to_vec());
                storage.commit_db()
            }
            ScanRange::Llsn { begin, end } => {
                opts.set_iterate_lower_bound(encode_data_key(begin).to_vec());
                opts.set_iterate_upper_bound(encode_data_key(end).to_vec());
                storage.data_db()
            }
        };
        let mut iter = db.raw_iterator_opt(opts);
        iter.seek_to_first();
        Self {
            storage,
            range,
            iter,
            done: false,
        }
    }

    pub fn range(&self) -> ScanRange {
        self.range
    }

    fn current(&self) -> Result<LogEntry, StorageError> {
        let (Some(key), Some(value)) = (self.iter.key(), self.iter.value()) else {
            return Err(StorageError::NoLogEntry);
        };
        match self.range {
            ScanRange::Glsn { .. } => {
                let glsn = decode_commit_key(key);
                let llsn = decode_data_key(value);
                match self.storage.data_db().get(value)? {
                    Some(data) => Ok(LogEntry::new(llsn, glsn, data)),
                    None => Err(StorageError::InconsistentWriteCommitState { glsn, llsn }),
                }
            }
            ScanRange::Llsn { .. } => Ok(LogEntry::new(
                decode_data_key(key),
                Glsn::INVALID,
                value.to_vec(),
            )),
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<LogEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.iter.valid() {
            self.done = true;
            return match self.iter.status() {
                Ok(()) => None,
                Err(err) => Some(Err(err.into())),
            };
        }
        let item = self.current();
        if item.is_err() {
            self.done = true;
        } else {
            self.iter.next();
        }
        Some(item)
    }
}
