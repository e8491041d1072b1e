//! Trail Store Client
//!
//! Senders, Receivers and the broker never persist anything themselves. Every
//! record they read or write (tasks, attempt trails, mirror share registrations,
//! snapshots) belongs to the administrative service and is reached through the
//! [`TrailStore`] trait:
//!
//! - [`client::StoreClient`] talks to the administrative service over its Unix socket;
//! - [`memory::MemoryStore`] keeps everything in-process, optionally mirroring
//!   share and snapshot operations onto a directory tree;
//! - [`service::serve`] exposes any store over the socket protocol.

pub mod client;
pub mod layout;
pub mod memory;
pub mod model;
pub mod service;

pub use model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("trail {0} already reached a final status")]
    AlreadyFinal(TrailId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store transport failure: {0}")]
    Transport(String),
    #[error("store failure: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Calls into the administrative service.
///
/// All calls are synchronous request/reply. Creating a share or a snapshot that
/// already exists is not an error, which is what lets a retried attempt reuse
/// whatever a crashed one left behind.
#[async_trait::async_trait]
pub trait TrailStore: Send + Sync + std::fmt::Debug {
    async fn appliance(&self, uuid: &str) -> Result<Appliance>;

    async fn replica(&self, id: ReplicaId) -> Result<Replica>;
    async fn replicas(&self) -> Result<Vec<Replica>>;
    async fn disable_replica(&self, id: ReplicaId) -> Result<()>;

    /// Trails of a replica, newest first.
    async fn replica_trails(&self, replica_id: ReplicaId) -> Result<Vec<ReplicaTrail>>;
    async fn create_replica_trail(
        &self,
        replica_id: ReplicaId,
        snap_name: &str,
    ) -> Result<ReplicaTrail>;
    async fn update_replica_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()>;
    async fn delete_replica_trail(&self, id: TrailId) -> Result<()>;

    /// Mirror share registration by local share name.
    async fn replica_share(&self, share: &str) -> Result<Option<ReplicaShare>>;
    async fn replica_shares(&self) -> Result<Vec<ReplicaShare>>;
    async fn create_replica_share(&self, new: NewReplicaShare) -> Result<ReplicaShare>;

    /// Trails of a mirror share, newest first.
    async fn receive_trails(&self, rshare_id: ReplicaShareId) -> Result<Vec<ReceiveTrail>>;
    async fn create_receive_trail(
        &self,
        rshare_id: ReplicaShareId,
        snap_name: &str,
    ) -> Result<ReceiveTrail>;
    async fn update_receive_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()>;
    async fn delete_receive_trail(&self, id: TrailId) -> Result<()>;

    async fn create_share(&self, pool: &str, share: &str) -> Result<()>;
    /// Snapshots of a share, oldest first.
    async fn snapshots(&self, pool: &str, share: &str) -> Result<Vec<String>>;
    /// Returns `false` when the snapshot already existed and was reused.
    async fn create_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<bool>;
    async fn delete_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()>;
    /// Replaces the live share with `snap`, which stops being a snapshot.
    async fn promote_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()>;

    async fn refresh_share_state(&self) -> Result<()>;
    async fn refresh_snapshot_state(&self) -> Result<()>;
}
