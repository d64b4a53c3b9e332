use crate::proto::SyncCommitContext;
use crate::types::{Glsn, Llsn, Version};
use serde::{Deserialize, Serialize};

pub const COMMIT_CONTEXT_LEN: usize = 40;

/// The last commit round applied to one replica: LLSNs starting at
/// `committed_llsn_begin` were assigned `[committed_glsn_begin,
/// committed_glsn_end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitContext {
    pub version: Version,
    pub high_watermark: Glsn,
    pub committed_glsn_begin: Glsn,
    pub committed_glsn_end: Glsn,
    pub committed_llsn_begin: Llsn,
}

impl CommitContext {
    /// True for a round in which this replica committed nothing but still
    /// observed the version and high watermark advance.
    pub fn is_empty(&self) -> bool {
        self.committed_glsn_begin == self.committed_glsn_end
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_glsn_end
            .distance_from(self.committed_glsn_begin)
    }

    /// First LLSN past this round's committed range.
    pub fn committed_llsn_end(&self) -> Llsn {
        self.committed_llsn_begin + self.committed_len()
    }

    pub fn encode(&self) -> [u8; COMMIT_CONTEXT_LEN] {
        let mut buf = [0u8; COMMIT_CONTEXT_LEN];
        let fields = [
            self.version.get(),
            self.high_watermark.get(),
            self.committed_glsn_begin.get(),
            self.committed_glsn_end.get(),
            self.committed_llsn_begin.get(),
        ];
        for (chunk, value) in buf.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
        buf
    }

    /// Panics on a value of the wrong length; only the commit-context key
    /// ever holds this encoding.
    pub fn decode(raw: &[u8]) -> Self {
        if raw.len() != COMMIT_CONTEXT_LEN {
            panic!(
                "storage: invalid commit context (len={}, expected {})",
                raw.len(),
                COMMIT_CONTEXT_LEN
            );
        }
        let mut fields = [0u64; 5];
        for (field, chunk) in fields.iter_mut().zip(raw.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *field = u64::from_be_bytes(bytes);
        }
        Self {
            version: Version::new(fields[0]),
            high_watermark: Glsn::new(fields[1]),
            committed_glsn_begin: Glsn::new(fields[2]),
            committed_glsn_end: Glsn::new(fields[3]),
            committed_llsn_begin: Llsn::new(fields[4]),
        }
    }
}

impl From<SyncCommitContext> for CommitContext {
    fn from(cc: SyncCommitContext) -> Self {
        Self {
            version: cc.version,
            high_watermark: cc.high_watermark,
            committed_glsn_begin: cc.committed_glsn_begin,
            committed_glsn_end: cc.committed_glsn_end,
            committed_llsn_begin: cc.committed_llsn_begin,
        }
    }
}

impl From<CommitContext> for SyncCommitContext {
    fn from(cc: CommitContext) -> Self {
        Self {
            version: cc.version,
            high_watermark: cc.high_watermark,
            committed_glsn_begin: cc.committed_glsn_begin,
            committed_glsn_end: cc.committed_glsn_end,
            committed_llsn_begin: cc.committed_llsn_begin,
        }
    }
}
