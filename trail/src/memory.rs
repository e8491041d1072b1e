//! In-process administrative service.
//!
//! Used when the engine is embedded and by the test suites. With a mount root
//! configured, share and snapshot calls are mirrored onto directories following
//! [`Layout`], which is what the external snapshot tool reads from and writes to.

use crate::layout::Layout;
use crate::model::*;
use crate::{Result, StoreError, TrailStore};

#[derive(Debug, Default)]
struct State {
    appliances: std::collections::BTreeMap<String, Appliance>,
    replicas: std::collections::BTreeMap<ReplicaId, Replica>,
    replica_trails: std::collections::BTreeMap<TrailId, ReplicaTrail>,
    replica_shares: std::collections::BTreeMap<ReplicaShareId, ReplicaShare>,
    receive_trails: std::collections::BTreeMap<TrailId, ReceiveTrail>,
    shares: std::collections::BTreeSet<(String, String)>,
    snapshots: std::collections::BTreeMap<(String, String), Vec<String>>,
    next_id: u64,
    disable_calls: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: std::sync::Mutex<State>,
    layout: Option<Layout>,
}

fn io_error(what: &str, path: &std::path::Path, e: std::io::Error) -> StoreError {
    StoreError::Other(format!("failed to {what} {path:?}: {e}"))
}

fn apply_update(
    status: &mut TrailStatus,
    end_ts: &mut Option<Timestamp>,
    kb: &mut u64,
    error: &mut Option<String>,
    id: TrailId,
    update: TrailUpdate,
) -> Result<()> {
    if status.is_final() {
        return Err(StoreError::AlreadyFinal(id));
    }
    match update {
        TrailUpdate::SnapshotCreated => return Ok(()),
        TrailUpdate::Succeeded { kb: total } => {
            *status = TrailStatus::Succeeded;
            *kb = total;
        }
        TrailUpdate::Failed { kb: total, error: text } => {
            *status = TrailStatus::Failed;
            *kb = total;
            *error = Some(text);
        }
    }
    *end_ts = Some(chrono::Utc::now());
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose share and snapshot calls also act on directories under `mount_root`.
    pub fn with_mount_root(mount_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            state: Default::default(),
            layout: Some(Layout::new(mount_root)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test thread must not wedge every other caller
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_appliance(&self, appliance: Appliance) {
        self.state()
            .appliances
            .insert(appliance.uuid.clone(), appliance);
    }

    /// Inserts or replaces a task definition, bumping its last-modified timestamp.
    pub fn put_replica(&self, mut replica: Replica) {
        replica.ts = chrono::Utc::now();
        self.state().replicas.insert(replica.id, replica);
    }

    pub fn replica_trail(&self, id: TrailId) -> Option<ReplicaTrail> {
        self.state().replica_trails.get(&id).cloned()
    }

    /// Number of times `disable_replica` was called.
    pub fn disable_calls(&self) -> usize {
        self.state().disable_calls
    }

    /// Writes a trail verbatim, for seeding history.
    pub fn insert_replica_trail(&self, mut trail: ReplicaTrail) -> ReplicaTrail {
        let mut state = self.state();
        trail.id = state.next_id();
        state.replica_trails.insert(trail.id, trail.clone());
        trail
    }

    async fn scan_snapshots(layout: &Layout, pool: &str, share: &str) -> Result<Vec<String>> {
        let dir = layout.snapshot_dir(pool, share);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_error("list", &dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &dir, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        sort_snapshots(&mut names);
        Ok(names)
    }
}

#[async_trait::async_trait]
impl TrailStore for MemoryStore {
    async fn appliance(&self, uuid: &str) -> Result<Appliance> {
        self.state()
            .appliances
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("appliance {uuid}")))
    }

    async fn replica(&self, id: ReplicaId) -> Result<Replica> {
        self.state()
            .replicas
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("replica {id}")))
    }

    async fn replicas(&self) -> Result<Vec<Replica>> {
        Ok(self.state().replicas.values().cloned().collect())
    }

    async fn disable_replica(&self, id: ReplicaId) -> Result<()> {
        let mut state = self.state();
        state.disable_calls += 1;
        let replica = state
            .replicas
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("replica {id}")))?;
        replica.enabled = false;
        replica.ts = chrono::Utc::now();
        Ok(())
    }

    async fn replica_trails(&self, replica_id: ReplicaId) -> Result<Vec<ReplicaTrail>> {
        Ok(self
            .state()
            .replica_trails
            .values()
            .rev()
            .filter(|trail| trail.replica_id == replica_id)
            .cloned()
            .collect())
    }

    async fn create_replica_trail(
        &self,
        replica_id: ReplicaId,
        snap_name: &str,
    ) -> Result<ReplicaTrail> {
        let mut state = self.state();
        if !state.replicas.contains_key(&replica_id) {
            return Err(StoreError::NotFound(format!("replica {replica_id}")));
        }
        let trail = ReplicaTrail {
            id: state.next_id(),
            replica_id,
            snap_name: snap_name.to_string(),
            kb_sent: 0,
            send_pending: chrono::Utc::now(),
            snapshot_created: None,
            end_ts: None,
            status: TrailStatus::Pending,
            error: None,
        };
        state.replica_trails.insert(trail.id, trail.clone());
        Ok(trail)
    }

    async fn update_replica_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()> {
        let mut state = self.state();
        let trail = state
            .replica_trails
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("replica trail {id}")))?;
        if update == TrailUpdate::SnapshotCreated && !trail.status.is_final() {
            trail.snapshot_created = Some(chrono::Utc::now());
        }
        apply_update(
            &mut trail.status,
            &mut trail.end_ts,
            &mut trail.kb_sent,
            &mut trail.error,
            id,
            update,
        )
    }

    async fn delete_replica_trail(&self, id: TrailId) -> Result<()> {
        self.state()
            .replica_trails
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("replica trail {id}")))
    }

    async fn replica_share(&self, share: &str) -> Result<Option<ReplicaShare>> {
        Ok(self
            .state()
            .replica_shares
            .values()
            .find(|rshare| rshare.share == share)
            .cloned())
    }

    async fn replica_shares(&self) -> Result<Vec<ReplicaShare>> {
        Ok(self.state().replica_shares.values().cloned().collect())
    }

    async fn create_replica_share(&self, new: NewReplicaShare) -> Result<ReplicaShare> {
        let mut state = self.state();
        if state.replica_shares.values().any(|r| r.share == new.share) {
            return Err(StoreError::Conflict(format!(
                "replica share {} already registered",
                new.share
            )));
        }
        let rshare = ReplicaShare {
            id: state.next_id(),
            share: new.share,
            pool: new.pool,
            appliance: new.appliance,
            src_share: new.src_share,
            ts: chrono::Utc::now(),
        };
        state.replica_shares.insert(rshare.id, rshare.clone());
        Ok(rshare)
    }

    async fn receive_trails(&self, rshare_id: ReplicaShareId) -> Result<Vec<ReceiveTrail>> {
        Ok(self
            .state()
            .receive_trails
            .values()
            .rev()
            .filter(|trail| trail.rshare_id == rshare_id)
            .cloned()
            .collect())
    }

    async fn create_receive_trail(
        &self,
        rshare_id: ReplicaShareId,
        snap_name: &str,
    ) -> Result<ReceiveTrail> {
        let mut state = self.state();
        if !state.replica_shares.contains_key(&rshare_id) {
            return Err(StoreError::NotFound(format!("replica share {rshare_id}")));
        }
        let trail = ReceiveTrail {
            id: state.next_id(),
            rshare_id,
            snap_name: snap_name.to_string(),
            kb_received: 0,
            receive_pending: chrono::Utc::now(),
            end_ts: None,
            status: TrailStatus::Pending,
            error: None,
        };
        state.receive_trails.insert(trail.id, trail.clone());
        Ok(trail)
    }

    async fn update_receive_trail(&self, id: TrailId, update: TrailUpdate) -> Result<()> {
        let mut state = self.state();
        let trail = state
            .receive_trails
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("receive trail {id}")))?;
        apply_update(
            &mut trail.status,
            &mut trail.end_ts,
            &mut trail.kb_received,
            &mut trail.error,
            id,
            update,
        )
    }

    async fn delete_receive_trail(&self, id: TrailId) -> Result<()> {
        self.state()
            .receive_trails
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("receive trail {id}")))
    }

    async fn create_share(&self, pool: &str, share: &str) -> Result<()> {
        if let Some(ref layout) = self.layout {
            let path = layout.share_path(pool, share);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| io_error("create", &path, e))?;
        }
        self.state()
            .shares
            .insert((pool.to_string(), share.to_string()));
        Ok(())
    }

    async fn snapshots(&self, pool: &str, share: &str) -> Result<Vec<String>> {
        let key = (pool.to_string(), share.to_string());
        Ok(self
            .state()
            .snapshots
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<bool> {
        if let Some(ref layout) = self.layout {
            let path = layout.snapshot_path(pool, share, snap);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| io_error("create", &path, e))?;
        }
        let mut state = self.state();
        let snaps = state
            .snapshots
            .entry((pool.to_string(), share.to_string()))
            .or_default();
        if snaps.iter().any(|s| s == snap) {
            return Ok(false);
        }
        snaps.push(snap.to_string());
        sort_snapshots(snaps);
        Ok(true)
    }

    async fn delete_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()> {
        if let Some(ref layout) = self.layout {
            let path = layout.snapshot_path(pool, share, snap);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("delete", &path, e)),
            }
        }
        let mut state = self.state();
        let snaps = state
            .snapshots
            .get_mut(&(pool.to_string(), share.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {share}/{snap}")))?;
        let before = snaps.len();
        snaps.retain(|s| s != snap);
        if snaps.len() == before {
            return Err(StoreError::NotFound(format!("snapshot {share}/{snap}")));
        }
        Ok(())
    }

    async fn promote_snapshot(&self, pool: &str, share: &str, snap: &str) -> Result<()> {
        {
            let state = self.state();
            let known = state
                .snapshots
                .get(&(pool.to_string(), share.to_string()))
                .is_some_and(|snaps| snaps.iter().any(|s| s == snap));
            if !known {
                return Err(StoreError::NotFound(format!("snapshot {share}/{snap}")));
            }
        }
        if let Some(ref layout) = self.layout {
            let share_path = layout.share_path(pool, share);
            match tokio::fs::remove_dir_all(&share_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &share_path, e)),
            }
            let snap_path = layout.snapshot_path(pool, share, snap);
            tokio::fs::rename(&snap_path, &share_path)
                .await
                .map_err(|e| io_error("promote", &snap_path, e))?;
        }
        let mut state = self.state();
        if let Some(snaps) = state
            .snapshots
            .get_mut(&(pool.to_string(), share.to_string()))
        {
            snaps.retain(|s| s != snap);
        }
        state
            .shares
            .insert((pool.to_string(), share.to_string()));
        Ok(())
    }

    async fn refresh_share_state(&self) -> Result<()> {
        tracing::debug!("share state refresh: {} shares", self.state().shares.len());
        Ok(())
    }

    /// Re-reads snapshot directories of every known share from disk.
    async fn refresh_snapshot_state(&self) -> Result<()> {
        let Some(ref layout) = self.layout else {
            return Ok(());
        };
        let shares: Vec<(String, String)> = self.state().shares.iter().cloned().collect();
        for (pool, share) in shares {
            let names = Self::scan_snapshots(layout, &pool, &share).await?;
            self.state().snapshots.insert((pool, share), names);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: ReplicaId) -> Replica {
        Replica {
            id,
            share: "vol1".to_string(),
            pool: "pool0".to_string(),
            appliance: "b".to_string(),
            dest_pool: "backup".to_string(),
            dest_ip: None,
            enabled: true,
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn trail_finalizes_exactly_once() -> Result<()> {
        let store = MemoryStore::new();
        store.put_replica(replica(7));
        let trail = store.create_replica_trail(7, "vol1_7_replication_1").await?;
        assert_eq!(trail.status, TrailStatus::Pending);
        store
            .update_replica_trail(trail.id, TrailUpdate::SnapshotCreated)
            .await?;
        store
            .update_replica_trail(trail.id, TrailUpdate::Succeeded { kb: 12 })
            .await?;
        let err = store
            .update_replica_trail(
                trail.id,
                TrailUpdate::Failed {
                    kb: 0,
                    error: "late".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyFinal(trail.id));
        let stored = store.replica_trail(trail.id).unwrap();
        assert_eq!(stored.status, TrailStatus::Succeeded);
        assert_eq!(stored.kb_sent, 12);
        assert!(stored.snapshot_created.is_some());
        assert!(stored.end_ts.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn trails_list_newest_first() -> Result<()> {
        let store = MemoryStore::new();
        store.put_replica(replica(1));
        let first = store.create_replica_trail(1, "a_1_replication_1").await?;
        let second = store.create_replica_trail(1, "a_1_replication_2").await?;
        let ids: Vec<_> = store
            .replica_trails(1)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_creation_is_idempotent() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.create_snapshot("p", "s", "s_1_replication_1").await?);
        assert!(!store.create_snapshot("p", "s", "s_1_replication_1").await?);
        assert_eq!(store.snapshots("p", "s").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn promotion_moves_snapshot_into_share() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_mount_root(root.path());
        let layout = Layout::new(root.path());
        store.create_share("p", "mirror").await?;
        store.create_snapshot("p", "mirror", "x_1").await?;
        store.create_snapshot("p", "mirror", "x_2").await?;
        std::fs::write(layout.snapshot_path("p", "mirror", "x_1").join("marker"), b"1").unwrap();
        store.promote_snapshot("p", "mirror", "x_1").await?;
        assert_eq!(store.snapshots("p", "mirror").await?, vec!["x_2"]);
        assert!(layout.share_path("p", "mirror").join("marker").exists());
        assert!(!layout.snapshot_path("p", "mirror", "x_1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_picks_up_snapshots_written_by_the_tool() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_mount_root(root.path());
        let layout = Layout::new(root.path());
        store.create_share("p", "mirror").await?;
        std::fs::create_dir_all(layout.snapshot_path("p", "mirror", "v_3_replication_2")).unwrap();
        std::fs::create_dir_all(layout.snapshot_path("p", "mirror", "v_3_replication_1")).unwrap();
        assert!(store.snapshots("p", "mirror").await?.is_empty());
        store.refresh_snapshot_state().await?;
        assert_eq!(
            store.snapshots("p", "mirror").await?,
            vec!["v_3_replication_1", "v_3_replication_2"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn disable_is_counted() -> Result<()> {
        let store = MemoryStore::new();
        store.put_replica(replica(3));
        store.disable_replica(3).await?;
        assert!(!store.replica(3).await?.enabled);
        assert_eq!(store.disable_calls(), 1);
        Ok(())
    }
}
