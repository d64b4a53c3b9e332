//! Per-replica storage engine: a data column (LLSN -> payload) and a commit
//! column (GLSN -> data key) plus one commit-context record, backed by
//! RocksDB either as one combined store or as two separate stores.

pub mod batch;
pub mod codec;
pub mod commit_context;
pub mod config;
pub mod error;
pub mod layout;
mod metrics;
pub mod recovery;
pub mod scanner;

pub use batch::{AppendBatch, CommitBatch, WriteBatch};
pub use commit_context::CommitContext;
pub use config::StorageConfig;
pub use error::StorageError;
pub use layout::StorageLayout;
pub use recovery::RecoveryPoints;
pub use scanner::{ScanRange, Scanner};

use crate::proto::{LogEntry, LogSequenceNumber};
use crate::types::{Glsn, Llsn};
use codec::{
    commit_key_lower_bound, commit_key_upper_bound, data_key_upper_bound, decode_commit_key,
    decode_data_key, encode_commit_key, encode_data_key, COMMIT_CONTEXT_KEY,
};
use log::{debug, info, warn};
use metrics::MetricsLogger;
use parking_lot::Mutex;
use rocksdb::{Options, ReadOptions, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;

/// Target of a point read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAt {
    Glsn(Glsn),
    Llsn(Llsn),
}

pub struct Storage {
    config: StorageConfig,
    layout: StorageLayout,
    data_db: Arc<DB>,
    commit_db: Arc<DB>,
    metrics: Mutex<Option<MetricsLogger>>,
}

impl Storage {
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let layout = StorageLayout::new(&config.path, config.separate_db);
        layout.ensure()?;

        let opts = db_options(&config);
        if config.verbose {
            info!(
                "event=storage_open path={} separate_db={} wal={} sync={} mem_table_size={} l0_compaction={} l0_slowdown={} l0_stop={} max_open_files={}",
                config.path.display(),
                config.separate_db,
                config.wal,
                config.sync,
                config.mem_table_size,
                config.l0_compaction_threshold,
                config.l0_slowdown_writes_threshold,
                config.l0_stop_writes_threshold,
                config.max_open_files
            );
        }
        let data_db = Arc::new(DB::open(&opts, layout.data_path())?);
        let commit_db = if layout.is_separate() {
            Arc::new(DB::open(&opts, layout.commit_path())?)
        } else {
            Arc::clone(&data_db)
        };

        let storage = Self {
            config,
            layout,
            data_db,
            commit_db,
            metrics: Mutex::new(None),
        };
        if storage.is_separate() {
            storage.drop_trimmed_data()?;
        }
        storage.start_metrics_logger()?;
        debug!("event=storage_opened path={}", storage.path().display());
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn is_separate(&self) -> bool {
        self.layout.is_separate()
    }

    pub(crate) fn data_db(&self) -> &DB {
        &self.data_db
    }

    pub(crate) fn commit_db(&self) -> &DB {
        &self.commit_db
    }

    pub(crate) fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync);
        opts.disable_wal(!self.config.wal);
        opts
    }

    pub fn new_write_batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    pub fn new_commit_batch(&self, cc: &CommitContext) -> CommitBatch<'_> {
        CommitBatch::new(self, cc)
    }

    pub fn new_append_batch(&self) -> AppendBatch<'_> {
        AppendBatch::new(self)
    }

    pub fn new_scanner(&self, range: ScanRange) -> Scanner<'_> {
        Scanner::new(self, range)
    }

    pub fn read(&self, at: ReadAt) -> Result<LogEntry, StorageError> {
        match at {
            ReadAt::Glsn(glsn) => self.read_at_glsn(glsn),
            ReadAt::Llsn(llsn) => self.read_at_llsn(llsn),
        }
    }

    pub fn read_at_glsn(&self, glsn: Glsn) -> Result<LogEntry, StorageError> {
        let mut scanner = self.new_scanner(ScanRange::Glsn {
            begin: glsn,
            end: glsn.next(),
        });
        scanner.next().unwrap_or(Err(StorageError::NoLogEntry))
    }

    /// Walks the commit column using the distance between the queried LLSN
    /// and the current position to jump close to the target.
    pub fn read_at_llsn(&self, llsn: Llsn) -> Result<LogEntry, StorageError> {
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(commit_key_lower_bound());
        opts.set_iterate_upper_bound(commit_key_upper_bound());
        let mut iter = self.commit_db.raw_iterator_opt(opts);
        iter.seek_to_first();
        while let (Some(key), Some(value)) = (iter.key(), iter.value()) {
            let cur_llsn = decode_data_key(value);
            if cur_llsn > llsn {
                break;
            }
            let cur_glsn = decode_commit_key(key);
            if cur_llsn == llsn {
                return self.read_at_glsn(cur_glsn);
            }
            let guess = cur_glsn + llsn.distance_from(cur_llsn);
            iter.seek(encode_commit_key(guess));
        }
        iter.status()?;
        Err(StorageError::NoLogEntry)
    }

    pub fn read_commit_context(&self) -> Result<CommitContext, StorageError> {
        match self.commit_db.get(COMMIT_CONTEXT_KEY)? {
            Some(raw) => Ok(CommitContext::decode(&raw)),
            None => Err(StorageError::NoCommitContext),
        }
    }

    /// Deletes every entry with GLSN at or below `glsn`, along with the data
    /// it points to. The commit context is kept.
    ///
    /// In the separate layout the commit column is written first. A crash
    /// between the two writes leaves data rows below the first committed
    /// entry, which nothing indexes and `open` deletes.
    pub fn trim(&self, glsn: Glsn) -> Result<(), StorageError> {
        let boundary = self.find_lte(glsn)?;
        let commit_begin = encode_commit_key(Glsn::MIN);
        let commit_end = encode_commit_key(boundary.glsn.next());
        let data_begin = encode_data_key(Llsn::MIN);
        let data_end = encode_data_key(boundary.llsn.next());

        let opts = self.write_options();
        if self.is_separate() {
            let mut commit_batch = rocksdb::WriteBatch::default();
            commit_batch.delete_range(commit_begin, commit_end);
            self.commit_db.write_opt(commit_batch, &opts)?;
            let mut data_batch = rocksdb::WriteBatch::default();
            data_batch.delete_range(data_begin, data_end);
            self.data_db.write_opt(data_batch, &opts)?;
        } else {
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_range(commit_begin, commit_end);
            batch.delete_range(data_begin, data_end);
            self.data_db.write_opt(batch, &opts)?;
        }
        info!(
            "event=storage_trim path={} requested_glsn={} trim_glsn={} trim_llsn={}",
            self.path().display(),
            glsn,
            boundary.glsn,
            boundary.llsn
        );
        Ok(())
    }

    /// Removes stored entries at or after `begin` that were never committed.
    pub fn delete_uncommitted(&self, begin: Llsn) -> Result<(), StorageError> {
        if begin.is_invalid() {
            return Ok(());
        }
        let mut batch = rocksdb::WriteBatch::default();
        batch.delete_range(encode_data_key(begin).to_vec(), data_key_upper_bound());
        self.data_db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Drops every entry, committed or not, and the commit context. The
    /// commit column goes first, so an interrupted purge reopens as a replica
    /// with uncommitted data only.
    pub fn purge(&self) -> Result<(), StorageError> {
        let commit_range = (commit_key_lower_bound(), commit_key_upper_bound());
        let data_range = (encode_data_key(Llsn::MIN).to_vec(), data_key_upper_bound());
        let opts = self.write_options();
        if self.is_separate() {
            let mut commit_batch = rocksdb::WriteBatch::default();
            commit_batch.delete_range(commit_range.0, commit_range.1);
            commit_batch.delete(COMMIT_CONTEXT_KEY);
            self.commit_db.write_opt(commit_batch, &opts)?;
            let mut data_batch = rocksdb::WriteBatch::default();
            data_batch.delete_range(data_range.0, data_range.1);
            self.data_db.write_opt(data_batch, &opts)?;
        } else {
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_range(commit_range.0, commit_range.1);
            batch.delete(COMMIT_CONTEXT_KEY);
            batch.delete_range(data_range.0, data_range.1);
            self.data_db.write_opt(batch, &opts)?;
        }
        info!("event=storage_purge path={}", self.path().display());
        Ok(())
    }

    /// Deletes data rows left below the committed prefix by a trim that
    /// stopped after its commit-column write.
    fn drop_trimmed_data(&self) -> Result<(), StorageError> {
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(commit_key_lower_bound());
        opts.set_iterate_upper_bound(commit_key_upper_bound());
        let mut iter = self.commit_db.raw_iterator_opt(opts);
        iter.seek_to_first();
        let boundary = match iter.value() {
            Some(value) => decode_data_key(value),
            None => {
                iter.status()?;
                match self.read_commit_context() {
                    Ok(cc) => cc.committed_llsn_end(),
                    Err(StorageError::NoCommitContext) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        };
        if boundary <= Llsn::MIN {
            return Ok(());
        }

        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(encode_data_key(Llsn::MIN).to_vec());
        opts.set_iterate_upper_bound(encode_data_key(boundary).to_vec());
        let mut iter = self.data_db.raw_iterator_opt(opts);
        iter.seek_to_first();
        if iter.key().is_none() {
            iter.status()?;
            return Ok(());
        }
        let mut batch = rocksdb::WriteBatch::default();
        batch.delete_range(encode_data_key(Llsn::MIN), encode_data_key(boundary));
        self.data_db.write_opt(batch, &self.write_options())?;
        warn!(
            "event=storage_trimmed_data_dropped path={} below_llsn={boundary}",
            self.path().display()
        );
        Ok(())
    }

    fn find_lte(&self, glsn: Glsn) -> Result<LogSequenceNumber, StorageError> {
        let upper = if glsn < Glsn::MAX {
            encode_commit_key(glsn.next()).to_vec()
        } else {
            commit_key_upper_bound()
        };
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(commit_key_lower_bound());
        opts.set_iterate_upper_bound(upper);
        let mut iter = self.commit_db.raw_iterator_opt(opts);
        iter.seek_to_last();
        match (iter.key(), iter.value()) {
            (Some(key), Some(value)) => Ok(LogSequenceNumber::new(
                decode_data_key(value),
                decode_commit_key(key),
            )),
            _ => {
                iter.status()?;
                Err(StorageError::NoLogEntry)
            }
        }
    }

    /// Approximate on-disk plus in-memory footprint of both columns.
    pub fn disk_usage(&self) -> u64 {
        self.physical_dbs()
            .into_iter()
            .map(|(_, db)| {
                ["rocksdb.total-sst-files-size", "rocksdb.cur-size-all-mem-tables"]
                    .into_iter()
                    .filter_map(|property| db.property_int_value(property).ok().flatten())
                    .sum::<u64>()
            })
            .sum()
    }

    /// Flushes memtables and stops the metrics logger. The stores close once
    /// the last handle is dropped.
    pub fn close(&self) -> Result<(), StorageError> {
        if let Some(logger) = self.metrics.lock().take() {
            logger.stop();
        }
        for (_, db) in self.physical_dbs() {
            db.flush()?;
        }
        debug!("event=storage_closed path={}", self.path().display());
        Ok(())
    }

    fn physical_dbs(&self) -> Vec<(&'static str, Arc<DB>)> {
        let mut dbs = vec![("data", Arc::clone(&self.data_db))];
        if self.is_separate() {
            dbs.push(("commit", Arc::clone(&self.commit_db)));
        }
        dbs
    }

    fn start_metrics_logger(&self) -> Result<(), StorageError> {
        let interval = self.config.metrics_log_interval;
        if interval.is_zero() {
            return Ok(());
        }
        let logger = MetricsLogger::start(
            self.path().display().to_string(),
            self.physical_dbs(),
            interval,
        )?;
        *self.metrics.lock() = Some(logger);
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(logger) = self.metrics.get_mut().take() {
            logger.stop();
        }
        for (column, db) in self.physical_dbs() {
            if let Err(err) = db.flush() {
                warn!(
                    "event=storage_flush_failed path={} column={column} error={err}",
                    self.path().display()
                );
            }
        }
    }
}

fn db_options(config: &StorageConfig) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_write_buffer_size(config.mem_table_size);
    opts.set_level_zero_file_num_compaction_trigger(config.l0_compaction_threshold);
    opts.set_level_zero_slowdown_writes_trigger(config.l0_slowdown_writes_threshold);
    opts.set_level_zero_stop_writes_trigger(config.l0_stop_writes_threshold);
    opts.set_max_open_files(config.max_open_files);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;
    use tempfile::TempDir;

    fn open(tmp: &TempDir, separate: bool) -> Storage {
        Storage::open(
            StorageConfig::new(tmp.path().join("ls"))
                .with_separate_db(separate)
                .with_sync(false),
        )
        .unwrap()
    }

    fn commit(storage: &Storage, pairs: &[(u64, u64)], hwm: u64) {
        let (first_llsn, first_glsn) = pairs[0];
        let cc = CommitContext {
            version: Version::new(1),
            high_watermark: Glsn::new(hwm),
            committed_glsn_begin: Glsn::new(first_glsn),
            committed_glsn_end: Glsn::new(first_glsn + pairs.len() as u64),
            committed_llsn_begin: Llsn::new(first_llsn),
        };
        let mut batch = storage.new_commit_batch(&cc);
        for &(llsn, glsn) in pairs {
            batch.set(Glsn::new(glsn), Llsn::new(llsn));
        }
        batch.apply().unwrap();
    }

    fn write(storage: &Storage, llsns: std::ops::RangeInclusive<u64>) {
        let mut batch = storage.new_write_batch();
        for llsn in llsns {
            batch.set(Llsn::new(llsn), format!("log-{llsn}").as_bytes());
        }
        batch.apply().unwrap();
    }

    #[test]
    fn write_then_commit_makes_entries_readable() {
        for separate in [false, true] {
            let tmp = TempDir::new().unwrap();
            let storage = open(&tmp, separate);
            write(&storage, 1..=2);
            assert!(matches!(
                storage.read(ReadAt::Llsn(Llsn::new(1))),
                Err(StorageError::NoLogEntry)
            ));
            assert!(matches!(
                storage.read(ReadAt::Glsn(Glsn::new(1))),
                Err(StorageError::NoLogEntry)
            ));

            commit(&storage, &[(1, 5), (2, 6)], 6);
            let by_llsn = storage.read(ReadAt::Llsn(Llsn::new(2))).unwrap();
            let by_glsn = storage.read(ReadAt::Glsn(Glsn::new(6))).unwrap();
            assert_eq!(by_llsn, by_glsn);
            assert_eq!(by_glsn.data, b"log-2");
            assert_eq!(by_glsn.llsn, Llsn::new(2));
        }
    }

    #[test]
    fn llsn_read_skips_across_gapped_glsns() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, false);
        write(&storage, 1..=6);
        commit(&storage, &[(1, 1), (2, 2)], 2);
        commit(&storage, &[(3, 10), (4, 11)], 11);
        commit(&storage, &[(5, 20), (6, 21)], 21);
        let entry = storage.read_at_llsn(Llsn::new(6)).unwrap();
        assert_eq!(entry.glsn, Glsn::new(21));
        let entry = storage.read_at_llsn(Llsn::new(3)).unwrap();
        assert_eq!(entry.glsn, Glsn::new(10));
        assert!(matches!(
            storage.read_at_llsn(Llsn::new(7)),
            Err(StorageError::NoLogEntry)
        ));
    }

    #[test]
    fn commit_without_data_is_inconsistent() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, true);
        commit(&storage, &[(1, 1)], 1);
        let err = storage.read_at_glsn(Glsn::new(1)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InconsistentWriteCommitState { .. }
        ));
    }

    #[test]
    fn scanners_walk_both_columns() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, false);
        write(&storage, 1..=4);
        commit(&storage, &[(1, 3), (2, 4), (3, 5)], 5);

        let committed: Vec<_> = storage
            .new_scanner(ScanRange::Glsn {
                begin: Glsn::MIN,
                end: Glsn::MAX,
            })
            .map(|entry| entry.unwrap().glsn.get())
            .collect();
        assert_eq!(committed, vec![3, 4, 5]);

        let stored: Vec<_> = storage
            .new_scanner(ScanRange::Llsn {
                begin: Llsn::new(2),
                end: Llsn::new(5),
            })
            .map(|entry| entry.unwrap())
            .collect();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|entry| entry.glsn.is_invalid()));
        assert_eq!(stored[2].llsn, Llsn::new(4));
    }

    #[test]
    fn trim_on_empty_store_reports_no_log_entry() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, false);
        for glsn in [Glsn::INVALID, Glsn::MIN, Glsn::MAX] {
            assert!(matches!(storage.trim(glsn), Err(StorageError::NoLogEntry)));
        }
    }

    #[test]
    fn trim_keeps_commit_context() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, true);
        write(&storage, 1..=4);
        commit(&storage, &[(1, 1), (2, 2), (3, 3), (4, 4)], 4);
        let before = storage.read_commit_context().unwrap();

        storage.trim(Glsn::new(2)).unwrap();
        assert!(storage.read_at_glsn(Glsn::new(2)).is_err());
        assert!(storage.read_at_llsn(Llsn::new(1)).is_err());
        assert_eq!(storage.read_at_glsn(Glsn::new(3)).unwrap().llsn, Llsn::new(3));
        assert_eq!(storage.read_commit_context().unwrap(), before);

        storage.trim(Glsn::MAX).unwrap();
        assert!(matches!(storage.trim(Glsn::MAX), Err(StorageError::NoLogEntry)));
        assert_eq!(storage.read_commit_context().unwrap(), before);
    }

    #[test]
    fn reopen_drops_data_left_by_an_interrupted_trim() {
        let tmp = TempDir::new().unwrap();
        {
            let storage = open(&tmp, true);
            write(&storage, 1..=4);
            commit(&storage, &[(1, 1), (2, 2), (3, 3), (4, 4)], 4);
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_range(encode_commit_key(Glsn::MIN), encode_commit_key(Glsn::new(3)));
            storage.commit_db().write(batch).unwrap();
            assert!(storage
                .data_db()
                .get(encode_data_key(Llsn::new(1)))
                .unwrap()
                .is_some());
        }

        let storage = open(&tmp, true);
        for llsn in [1, 2] {
            assert!(storage
                .data_db()
                .get(encode_data_key(Llsn::new(llsn)))
                .unwrap()
                .is_none());
        }
        let stored: Vec<_> = storage
            .new_scanner(ScanRange::Llsn {
                begin: Llsn::MIN,
                end: Llsn::MAX,
            })
            .map(|entry| entry.unwrap().llsn.get())
            .collect();
        assert_eq!(stored, vec![3, 4]);
        let rp = storage.read_recovery_points().unwrap();
        assert_eq!(rp.first_committed.unwrap().llsn, Llsn::new(3));
        assert!(!rp.has_uncommitted());
        assert_eq!(storage.read_at_glsn(Glsn::new(3)).unwrap().data, b"log-3");
    }

    #[test]
    fn purge_drops_entries_and_commit_context() {
        for separate in [false, true] {
            let tmp = TempDir::new().unwrap();
            let storage = open(&tmp, separate);
            write(&storage, 1..=3);
            commit(&storage, &[(1, 1), (2, 2)], 2);

            storage.purge().unwrap();
            assert!(matches!(
                storage.read_commit_context(),
                Err(StorageError::NoCommitContext)
            ));
            assert!(storage.read_at_glsn(Glsn::new(1)).is_err());
            assert_eq!(storage.read_recovery_points().unwrap(), RecoveryPoints::default());
        }
    }

    #[test]
    fn append_batch_writes_entry_and_index_together() {
        for separate in [false, true] {
            let tmp = TempDir::new().unwrap();
            let storage = open(&tmp, separate);
            let mut batch = storage.new_append_batch();
            batch.set_log_entry(Llsn::new(1), Glsn::new(7), b"a");
            batch.set_log_entry(Llsn::new(2), Glsn::new(8), b"b");
            batch.set_commit_context(&CommitContext {
                version: Version::new(3),
                high_watermark: Glsn::new(8),
                committed_glsn_begin: Glsn::new(7),
                committed_glsn_end: Glsn::new(9),
                committed_llsn_begin: Llsn::new(1),
            });
            batch.apply().unwrap();
            assert_eq!(storage.read_at_llsn(Llsn::new(2)).unwrap().glsn, Glsn::new(8));
            assert_eq!(storage.read_commit_context().unwrap().version, Version::new(3));
        }
    }

    #[test]
    fn recovery_points_track_uncommitted_suffix() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, false);
        let empty = storage.read_recovery_points().unwrap();
        assert_eq!(empty, RecoveryPoints::default());

        write(&storage, 1..=5);
        let rp = storage.read_recovery_points().unwrap();
        assert!(rp.last_commit_context.is_none());
        assert_eq!(rp.uncommitted_llsn_begin, Llsn::MIN);
        assert_eq!(rp.uncommitted_llsn_end, Llsn::new(6));

        commit(&storage, &[(1, 1), (2, 2)], 2);
        let rp = storage.read_recovery_points().unwrap();
        assert_eq!(rp.first_committed, Some(LogSequenceNumber::new(Llsn::new(1), Glsn::new(1))));
        assert_eq!(rp.last_committed, Some(LogSequenceNumber::new(Llsn::new(2), Glsn::new(2))));
        assert_eq!(rp.uncommitted_llsn_begin, Llsn::new(3));
        assert_eq!(rp.uncommitted_llsn_end, Llsn::new(6));
    }

    #[test]
    fn recovery_points_fail_on_missing_data() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, true);
        commit(&storage, &[(1, 1)], 1);
        assert!(storage.read_recovery_points().is_err());
    }

    #[test]
    fn reopen_rejects_mode_switch() {
        let tmp = TempDir::new().unwrap();
        drop(open(&tmp, true));
        let err = Storage::open(StorageConfig::new(tmp.path().join("ls")).with_sync(false))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::InvalidLayout { .. }));
    }

    #[test]
    fn delete_uncommitted_drops_suffix_only() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, false);
        write(&storage, 1..=4);
        commit(&storage, &[(1, 1), (2, 2)], 2);
        storage.delete_uncommitted(Llsn::new(3)).unwrap();
        let rp = storage.read_recovery_points().unwrap();
        assert!(!rp.has_uncommitted());
        assert_eq!(storage.read_at_llsn(Llsn::new(2)).unwrap().data, b"log-2");
        assert!(storage.disk_usage() > 0);
        storage.close().unwrap();
    }
}
