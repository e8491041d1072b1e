use tracing::instrument;

use crate::model::*;
use crate::service::{StoreReply, StoreRequest};
use crate::{Result, StoreError, TrailStore};

type Connection = (remote::streams::LocalSendStream, remote::streams::LocalRecvStream);

/// [`TrailStore`] backed by the administrative service's Unix socket.
///
/// Connects lazily and keeps one connection; a transport failure drops it so
/// the next call reconnects.
#[derive(Debug)]
pub struct StoreClient {
    path: std::path::PathBuf,
    timeout: std::time::Duration,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

fn unexpected(reply: StoreReply) -> StoreError {
    StoreError::Transport(format!("unexpected store reply: {reply:?}"))
}

impl StoreClient {
    pub fn new(path: impl Into<std::path::PathBuf>, timeout: std::time::Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn exchange(
        conn: &mut Connection,
        request: &StoreRequest,
    ) -> anyhow::Result<Option<Result<StoreReply>>> {
        conn.0.send_object(request).await?;
        conn.1.recv_object::<Result<StoreReply>>().await
    }

    #[instrument(level = "trace", skip(self))]
    async fn call(&self, request: StoreRequest) -> Result<StoreReply> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(remote::connect_local(&self.path, self.timeout).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Transport("no store connection".to_string()));
        };
        let outcome = tokio::time::timeout(self.timeout, Self::exchange(conn, &request)).await;
        match outcome {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                *guard = None;
                Err(StoreError::Transport("store closed the connection".to_string()))
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(e.into())
            }
            Err(_) => {
                *guard = None;
                Err(StoreError::Transport(format!(
                    "no store reply within {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn call_done(&self, request: StoreRequest) -> Result<()> {
        match self.call(request).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait::async_trait]
impl TrailStore for StoreClient {
    async fn appliance(&self, uuid: &str) -> Result<Appliance> {
        match self
            .call(StoreRequest::Appliance {
                uuid: uuid.to_string(),
            })
            .await?
        {
            StoreReply::Appliance(appliance) => Ok(appliance),
            other => Err(unexpected(other)),
        }
    }

    async fn replica(&self, id: ReplicaId) -> Result<Replica> {
        match self.call(StoreRequest::Replica { id }).await? {
            StoreReply::Replica(replica) => Ok(replica),
            other => Err(unexpected(other)),
        }
    }

    async fn replicas(&self) -> Result<Vec<Replica>> {
        match self.call(StoreRequest::Replicas).await? {
            StoreReply::Replicas(replicas) => Ok(replicas),
            other => Err(unexpected(other)),
        }
    }

    async fn disable_replica(&self, id: ReplicaId) -> Result<()> {
        self.call_done(StoreRequest::DisableReplica { id }).await
    }

    async fn replica_trails(&self, replica_id: ReplicaId) -> Result<Vec<ReplicaTrail>> {
        match self.call(StoreRequest::ReplicaTrails { replica_id }).await? {
            StoreReply::ReplicaTrails(trails) => Ok(trails),
            other => Err(unexpected(other)),
        }
    }

    async fn create_replica_trail(
        &self,
        replica_id: ReplicaId,
        snap_name: &str,
    ) -> Result<ReplicaTrail> {
        let request = StoreRequest::CreateReplicaTrail {
            replica_id,
            snap_name: snap_name.to_string(),
        };
        match self.call(request).await? {
            StoreReply::ReplicaTrail(trail) => Ok(trail),
            other => Err(unexpected(other)),
        }
    }

    async fn update_replica_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()> {
        self.call_done(StoreRequest::UpdateReplicaTrail { id, update })
            .await
    }

    async fn delete_replica_trail(&self, id: TrailId) -> Result<()> {
        self.call_done(StoreRequest::DeleteReplicaTrail { id }).await
    }

    async fn replica_share(&self, share: &str) -> Result<Option<ReplicaShare>> {
        let request = StoreRequest::ReplicaShare {
            share: share.to_string(),
        };
        match self.call(request).await? {
            StoreReply::ReplicaShare(rshare) => Ok(rshare),
            other => Err(unexpected(other)),
        }
    }

    async fn replica_shares(&self) -> Result<Vec<ReplicaShare>> {
        match self.call(StoreRequest::ReplicaShares).await? {
            StoreReply::ReplicaShares(rshares) => Ok(rshares),
            other => Err(unexpected(other)),
        }
    }

    async fn create_replica_share(&self, new: NewReplicaShare) -> Result<ReplicaShare> {
        match self.call(StoreRequest::CreateReplicaShare { new }).await? {
            StoreReply::NewReplicaShare(rshare) => Ok(rshare),
            other => Err(unexpected(other)),
        }
    }

    async fn receive_trails(&self, rshare_id: ReplicaShareId) -> Result<Vec<ReceiveTrail>> {
        match self.call(StoreRequest::ReceiveTrails { rshare_id }).await? {
            StoreReply::ReceiveTrails(trails) => Ok(trails),
            other => Err(unexpected(other)),
        }
    }

    async fn create_receive_trail(
        &self,
        rshare_id: ReplicaShareId,
        snap_name: &str,
    ) -> Result<ReceiveTrail> {
        let request = StoreRequest::CreateReceiveTrail {
            rshare_id,
            snap_name: snap_name.to_string(),
        };
        match self.call(request).await? {
            StoreReply::ReceiveTrail(trail) => Ok(trail),
            other => Err(unexpected(other)),
        }
    }

    async fn update_receive_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()> {
        self.call_done(StoreRequest::UpdateReceiveTrail { id, update })
            .await
    }

    async fn delete_receive_trail(&self, id: TrailId) -> Result<()> {
        self.call_done(StoreRequest::DeleteReceiveTrail { id }).await
    }

    async fn create_share(&self, pool: &str, share: &str) -> Result<()> {
        self.call_done(StoreRequest::CreateShare {
            pool: pool.to_string(),
            share: share.to_string(),
        })
        .await
    }

    async fn snapshots(&self, pool: &str, share: &str) -> Result<Vec<String>> {
        let request = StoreRequest::Snapshots {
            pool: pool.to_string(),
            share: share.to_string(),
        };
        match self.call(request).await? {
            StoreReply::Snapshots(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn create_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<bool> {
        let request = StoreRequest::CreateSnapshot {
            pool: pool.to_string(),
            share: share.to_string(),
            snap: snap.to_string(),
        };
        match self.call(request).await? {
            StoreReply::Created(created) => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()> {
        self.call_done(StoreRequest::DeleteSnapshot {
            pool: pool.to_string(),
            share: share.to_string(),
            snap: snap.to_string(),
        })
        .await
    }

    async fn promote_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()> {
        self.call_done(StoreRequest::PromoteSnapshot {
            pool: pool.to_string(),
            share: share.to_string(),
            snap: snap.to_string(),
        })
        .await
    }

    async fn refresh_share_state(&self) -> Result<()> {
        self.call_done(StoreRequest::RefreshShareState).await
    }

    async fn refresh_snapshot_state(&self) -> Result<()> {
        self.call_done(StoreRequest::RefreshSnapshotState).await
    }
}
