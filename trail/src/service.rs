//! Socket protocol of the administrative service.
//!
//! One bincode-encoded [`StoreRequest`] per frame, answered by one
//! `Result<StoreReply, StoreError>` frame on the same connection.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::model::*;
use crate::{Result, StoreError, TrailStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRequest {
    Appliance { uuid: String },
    Replica { id: ReplicaId },
    Replicas,
    DisableReplica { id: ReplicaId },
    ReplicaTrails { replica_id: ReplicaId },
    CreateReplicaTrail { replica_id: ReplicaId, snap_name: String },
    UpdateReplicaTrail { id: TrailId, update: TrailUpdate },
    DeleteReplicaTrail { id: TrailId },
    ReplicaShare { share: String },
    ReplicaShares,
    CreateReplicaShare { new: NewReplicaShare },
    ReceiveTrails { rshare_id: ReplicaShareId },
    CreateReceiveTrail { rshare_id: ReplicaShareId, snap_name: String },
    UpdateReceiveTrail { id: TrailId, update: TrailUpdate },
    DeleteReceiveTrail { id: TrailId },
    CreateShare { pool: String, share: String },
    Snapshots { pool: String, share: String },
    CreateSnapshot { pool: String, share: String, snap: String },
    DeleteSnapshot { pool: String, share: String, snap: String },
    PromoteSnapshot { pool: String, share: String, snap: String },
    RefreshShareState,
    RefreshSnapshotState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreReply {
    Done,
    Created(bool),
    Appliance(Appliance),
    Replica(Replica),
    Replicas(Vec<Replica>),
    ReplicaTrail(ReplicaTrail),
    ReplicaTrails(Vec<ReplicaTrail>),
    ReplicaShare(Option<ReplicaShare>),
    NewReplicaShare(ReplicaShare),
    ReplicaShares(Vec<ReplicaShare>),
    ReceiveTrail(ReceiveTrail),
    ReceiveTrails(Vec<ReceiveTrail>),
    Snapshots(Vec<String>),
}

/// Runs one request against `store`.
pub async fn dispatch(store: &dyn TrailStore, request: StoreRequest) -> Result<StoreReply> {
    let reply = match request {
        StoreRequest::Appliance { uuid } => StoreReply::Appliance(store.appliance(&uuid).await?),
        StoreRequest::Replica { id } => StoreReply::Replica(store.replica(id).await?),
        StoreRequest::Replicas => StoreReply::Replicas(store.replicas().await?),
        StoreRequest::DisableReplica { id } => {
            store.disable_replica(id).await?;
            StoreReply::Done
        }
        StoreRequest::ReplicaTrails { replica_id } => {
            StoreReply::ReplicaTrails(store.replica_trails(replica_id).await?)
        }
        StoreRequest::CreateReplicaTrail {
            replica_id,
            snap_name,
        } => StoreReply::ReplicaTrail(store.create_replica_trail(replica_id, &snap_name).await?),
        StoreRequest::UpdateReplicaTrail { id, update } => {
            store.update_replica_trail(id, update).await?;
            StoreReply::Done
        }
        StoreRequest::DeleteReplicaTrail { id } => {
            store.delete_replica_trail(id).await?;
            StoreReply::Done
        }
        StoreRequest::ReplicaShare { share } => {
            StoreReply::ReplicaShare(store.replica_share(&share).await?)
        }
        StoreRequest::ReplicaShares => StoreReply::ReplicaShares(store.replica_shares().await?),
        StoreRequest::CreateReplicaShare { new } => {
            StoreReply::NewReplicaShare(store.create_replica_share(new).await?)
        }
        StoreRequest::ReceiveTrails { rshare_id } => {
            StoreReply::ReceiveTrails(store.receive_trails(rshare_id).await?)
        }
        StoreRequest::CreateReceiveTrail {
            rshare_id,
            snap_name,
        } => StoreReply::ReceiveTrail(store.create_receive_trail(rshare_id, &snap_name).await?),
        StoreRequest::UpdateReceiveTrail { id, update } => {
            store.update_receive_trail(id, update).await?;
            StoreReply::Done
        }
        StoreRequest::DeleteReceiveTrail { id } => {
            store.delete_receive_trail(id).await?;
            StoreReply::Done
        }
        StoreRequest::CreateShare { pool, share } => {
            store.create_share(&pool, &share).await?;
            StoreReply::Done
        }
        StoreRequest::Snapshots { pool, share } => {
            StoreReply::Snapshots(store.snapshots(&pool, &share).await?)
        }
        StoreRequest::CreateSnapshot { pool, share, snap } => {
            StoreReply::Created(store.create_snapshot(&pool, &share, &snap).await?)
        }
        StoreRequest::DeleteSnapshot { pool, share, snap } => {
            store.delete_snapshot(&pool, &share, &snap).await?;
            StoreReply::Done
        }
        StoreRequest::PromoteSnapshot { pool, share, snap } => {
            store.promote_snapshot(&pool, &share, &snap).await?;
            StoreReply::Done
        }
        StoreRequest::RefreshShareState => {
            store.refresh_share_state().await?;
            StoreReply::Done
        }
        StoreRequest::RefreshSnapshotState => {
            store.refresh_snapshot_state().await?;
            StoreReply::Done
        }
    };
    Ok(reply)
}

async fn handle_connection(
    store: std::sync::Arc<dyn TrailStore>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let (mut send, mut recv) = remote::local_streams(stream);
    while let Some(request) = recv.recv_object::<StoreRequest>().await? {
        tracing::trace!("store request: {:?}", request);
        let reply = dispatch(store.as_ref(), request).await;
        if let Err(ref e) = reply {
            tracing::debug!("store request failed: {}", e);
        }
        send.send_object(&reply).await?;
    }
    Ok(())
}

/// Serves `store` on `listener` until `cancel` fires.
#[instrument(skip_all)]
pub async fn serve(
    store: std::sync::Arc<dyn TrailStore>,
    listener: tokio::net::UnixListener,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let store = store.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(store, stream).await {
                        tracing::warn!("store connection ended with error: {:#}", e);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
    tracing::info!("store service stopped");
    Ok(())
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Transport(format!("{e:#}"))
    }
}
