use crate::proto::LogSequenceNumber;
use crate::storage::codec::{
    commit_key_lower_bound, commit_key_upper_bound, data_key_upper_bound, decode_commit_key,
    decode_data_key, encode_data_key,
};
use crate::storage::commit_context::CommitContext;
use crate::storage::error::StorageError;
use crate::storage::Storage;
use crate::types::Llsn;
use rocksdb::ReadOptions;

/// Boundaries read at open to rebuild a replica's in-memory state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPoints {
    pub last_commit_context: Option<CommitContext>,
    pub first_committed: Option<LogSequenceNumber>,
    pub last_committed: Option<LogSequenceNumber>,
    /// `[begin, end)` of stored but uncommitted entries; both invalid when
    /// there are none.
    pub uncommitted_llsn_begin: Llsn,
    pub uncommitted_llsn_end: Llsn,
}

impl RecoveryPoints {
    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted_llsn_begin.is_invalid()
    }
}

impl Storage {
    /// A commit context that disagrees with the stored entries is tolerated;
    /// an index entry without data is not.
    pub fn read_recovery_points(&self) -> Result<RecoveryPoints, StorageError> {
        let last_commit_context = match self.read_commit_context() {
            Ok(cc) => Some(cc),
            Err(StorageError::NoCommitContext) => None,
            Err(err) => return Err(err),
        };
        let (first_committed, last_committed) = self.read_log_entry_boundaries()?;

        let uncommitted_begin = last_commit_context
            .map(|cc| cc.committed_llsn_end())
            .unwrap_or(Llsn::MIN);
        let (uncommitted_llsn_begin, uncommitted_llsn_end) =
            self.read_uncommitted_boundaries(uncommitted_begin)?;

        Ok(RecoveryPoints {
            last_commit_context,
            first_committed,
            last_committed,
            uncommitted_llsn_begin,
            uncommitted_llsn_end,
        })
    }

    fn read_log_entry_boundaries(
        &self,
    ) -> Result<(Option<LogSequenceNumber>, Option<LogSequenceNumber>), StorageError> {
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(commit_key_lower_bound());
        opts.set_iterate_upper_bound(commit_key_upper_bound());
        let mut iter = self.commit_db().raw_iterator_opt(opts);

        iter.seek_to_first();
        let Some(first_key) = iter.key() else {
            iter.status()?;
            return Ok((None, None));
        };
        let first = self.read_at_glsn(decode_commit_key(first_key))?.position();

        iter.seek_to_last();
        let Some(last_key) = iter.key() else {
            iter.status()?;
            return Ok((Some(first), None));
        };
        let last = self.read_at_glsn(decode_commit_key(last_key))?.position();
        Ok((Some(first), Some(last)))
    }

    fn read_uncommitted_boundaries(&self, begin: Llsn) -> Result<(Llsn, Llsn), StorageError> {
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(encode_data_key(begin).to_vec());
        opts.set_iterate_upper_bound(data_key_upper_bound());
        let mut iter = self.data_db().raw_iterator_opt(opts);

        iter.seek_to_first();
        let Some(first_key) = iter.key() else {
            iter.status()?;
            return Ok((Llsn::INVALID, Llsn::INVALID));
        };
        let found = decode_data_key(first_key);
        if found != begin {
            return Err(StorageError::UnexpectedUncommittedBegin {
                expected: begin,
                found,
            });
        }
        iter.seek_to_last();
        let end = match iter.key() {
            Some(key) => decode_data_key(key).next(),
            None => begin.next(),
        };
        Ok((begin, end))
    }
}
