use crate::types::{Glsn, Llsn};
use serde::{Deserialize, Serialize};

/// Position of one entry in both sequence spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSequenceNumber {
    pub llsn: Llsn,
    pub glsn: Glsn,
}

impl LogSequenceNumber {
    pub fn new(llsn: Llsn, glsn: Glsn) -> Self {
        Self { llsn, glsn }
    }
}

/// One stored entry. `glsn` stays invalid until the entry is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub llsn: Llsn,
    pub glsn: Glsn,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(llsn: Llsn, glsn: Glsn, data: impl Into<Vec<u8>>) -> Self {
        Self {
            llsn,
            glsn,
            data: data.into(),
        }
    }

    pub fn position(&self) -> LogSequenceNumber {
        LogSequenceNumber::new(self.llsn, self.glsn)
    }

    pub fn is_committed(&self) -> bool {
        !self.glsn.is_invalid()
    }
}
