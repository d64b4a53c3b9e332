//! Replication seam between log-stream replicas.
//!
//! A primary pushes `(llsn, data)` to its backups through a
//! [`ReplicationClient`] obtained from a [`Connector`]; the receiving side is a
//! [`ReplicationHandler`]. [`LocalReplicationNetwork`] wires both ends
//! in-process.

mod error;
mod local;

pub use error::ReplicationError;
pub use local::{LocalConnector, LocalReplicationNetwork};

use crate::proto::{Replica, SyncPayload, SyncPosition, SyncRange};
use crate::types::Llsn;
use async_trait::async_trait;
use std::sync::Arc;

/// Client half of one primary-to-backup stream.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    fn replica(&self) -> &Replica;

    /// Acknowledged once the backup has durably stored the entry.
    async fn replicate(&self, llsn: Llsn, data: Vec<u8>) -> Result<(), ReplicationError>;

    /// Opens a sync session. The answer is the first position the destination
    /// still needs; an invalid GLSN means it needs nothing.
    async fn sync_init(
        &self,
        source: &Replica,
        range: SyncRange,
    ) -> Result<SyncPosition, ReplicationError>;

    async fn sync_replicate(
        &self,
        source: &Replica,
        payload: SyncPayload,
    ) -> Result<(), ReplicationError>;

    async fn close(&self);
}

/// Hands out clients per replica and owns their lifetime.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn get(&self, replica: &Replica) -> Result<Arc<dyn ReplicationClient>, ReplicationError>;

    async fn close(&self);
}

/// Builds fresh connectors; a replicator resets by closing the old connector
/// and asking for a new one.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self) -> Arc<dyn Connector>;
}

/// Server half, implemented by the replica executor.
#[async_trait]
pub trait ReplicationHandler: Send + Sync {
    async fn handle_replicate(&self, llsn: Llsn, data: Vec<u8>) -> Result<(), ReplicationError>;

    async fn handle_sync_init(
        &self,
        source: &Replica,
        range: SyncRange,
    ) -> Result<SyncPosition, ReplicationError>;

    async fn handle_sync_replicate(
        &self,
        source: &Replica,
        payload: SyncPayload,
    ) -> Result<(), ReplicationError>;
}
