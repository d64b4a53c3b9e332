use crate::proto::Replica;
use crate::types::Llsn;
use std::sync::Arc;
use std::time::Instant;

/// A contiguous run of freshly appended entries, fanned out to every backup.
#[derive(Debug, Clone)]
pub struct ReplicateTask {
    pub first_llsn: Llsn,
    pub data: Arc<Vec<Vec<u8>>>,
    pub replicas: Vec<Replica>,
    pub created_at: Instant,
}

impl ReplicateTask {
    pub fn new(first_llsn: Llsn, data: Vec<Vec<u8>>, replicas: Vec<Replica>) -> Self {
        Self {
            first_llsn,
            data: Arc::new(data),
            replicas,
            created_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn fan_out(&self) -> i64 {
        self.replicas.len() as i64
    }
}
