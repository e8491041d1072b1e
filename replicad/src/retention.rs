//! Retention of snapshots and trails, and the retry budget of a task.

use tracing::instrument;

use crate::snapshot;

/// Consecutive failed trails, newest first, that ended after `since`.
///
/// Failures that ended before the task was last modified don't count: editing
/// a task gives it a fresh retry budget.
pub fn consecutive_failures(trails: &[trail::ReplicaTrail], since: trail::Timestamp) -> usize {
    trails
        .iter()
        .take_while(|t| t.status == trail::TrailStatus::Failed)
        .filter(|t| t.end_ts.is_some_and(|end| end > since))
        .count()
}

/// Newest succeeded trail, the base of the next incremental transfer.
pub fn newest_succeeded(trails: &[trail::ReplicaTrail]) -> Option<&trail::ReplicaTrail> {
    trails
        .iter()
        .find(|t| t.status == trail::TrailStatus::Succeeded)
}

/// Deletes this task's replication snapshots beyond the newest `keep`, never `current`.
#[instrument(skip(store))]
pub async fn prune_sender_snapshots(
    store: &dyn trail::TrailStore,
    replica: &trail::Replica,
    keep: usize,
    current: &str,
) -> trail::Result<Vec<String>> {
    let mut ours: Vec<String> = store
        .snapshots(&replica.pool, &replica.share)
        .await?
        .into_iter()
        .filter(|name| snapshot::is_replication_snapshot(name, &replica.share, replica.id))
        .collect();
    trail::sort_snapshots(&mut ours);
    let excess = ours.len().saturating_sub(keep);
    let mut deleted = Vec::new();
    for name in ours.into_iter().take(excess) {
        if name == current {
            continue;
        }
        store
            .delete_snapshot(&replica.pool, &replica.share, &name)
            .await?;
        tracing::info!("deleted snapshot {} of {}", name, replica.share);
        deleted.push(name);
    }
    Ok(deleted)
}

/// Promotes the oldest snapshots of a mirror share into the live share until
/// fewer than `keep` remain, leaving room for the one about to arrive.
///
/// Returns the snapshots left, oldest first.
#[instrument(skip(store))]
pub async fn roll_mirror_snapshots(
    store: &dyn trail::TrailStore,
    pool: &str,
    share: &str,
    keep: usize,
) -> trail::Result<Vec<String>> {
    let mut snaps = store.snapshots(pool, share).await?;
    trail::sort_snapshots(&mut snaps);
    while !snaps.is_empty() && snaps.len() >= keep {
        let oldest = snaps.remove(0);
        store.promote_snapshot(pool, share, &oldest).await?;
        tracing::info!("promoted {} into mirror share {}", oldest, share);
    }
    Ok(snaps)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub replica_trails: usize,
    pub receive_trails: usize,
}

fn expired(
    status: trail::TrailStatus,
    end_ts: Option<trail::Timestamp>,
    cutoff: trail::Timestamp,
) -> bool {
    status.is_final() && end_ts.is_some_and(|end| end < cutoff)
}

/// Deletes terminal trails that ended before `now - window`.
///
/// The newest succeeded trail of every task and mirror share survives, it is
/// what the next incremental transfer is based on.
#[instrument(skip(store))]
pub async fn prune_trails(
    store: &dyn trail::TrailStore,
    window: std::time::Duration,
    now: trail::Timestamp,
) -> trail::Result<PruneReport> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let cutoff = now
        .checked_sub_signed(window)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
    let mut report = PruneReport::default();
    for replica in store.replicas().await? {
        let trails = store.replica_trails(replica.id).await?;
        let keep = newest_succeeded(&trails).map(|t| t.id);
        for t in &trails {
            if Some(t.id) != keep && expired(t.status, t.end_ts, cutoff) {
                store.delete_replica_trail(t.id).await?;
                report.replica_trails += 1;
            }
        }
    }
    for rshare in store.replica_shares().await? {
        let trails = store.receive_trails(rshare.id).await?;
        let keep = trails
            .iter()
            .find(|t| t.status == trail::TrailStatus::Succeeded)
            .map(|t| t.id);
        for t in &trails {
            if Some(t.id) != keep && expired(t.status, t.end_ts, cutoff) {
                store.delete_receive_trail(t.id).await?;
                report.receive_trails += 1;
            }
        }
    }
    tracing::info!(
        "pruned {} replica trails and {} receive trails ended before {}",
        report.replica_trails,
        report.receive_trails,
        cutoff
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail::TrailStore;

    fn replica() -> trail::Replica {
        trail::Replica {
            id: 7,
            share: "vol1".to_string(),
            pool: "pool0".to_string(),
            appliance: "b".to_string(),
            dest_pool: "backup".to_string(),
            dest_ip: None,
            enabled: true,
            ts: chrono::Utc::now() - chrono::Duration::hours(1),
        }
    }

    fn ended(status: trail::TrailStatus, ago: chrono::Duration) -> trail::ReplicaTrail {
        let end = chrono::Utc::now() - ago;
        trail::ReplicaTrail {
            id: 0,
            replica_id: 7,
            snap_name: "vol1_7_replication_1".to_string(),
            kb_sent: 0,
            send_pending: end,
            snapshot_created: None,
            end_ts: Some(end),
            status,
            error: None,
        }
    }

    #[test]
    fn failures_before_last_edit_do_not_count() {
        let since = chrono::Utc::now() - chrono::Duration::minutes(30);
        let trails = vec![
            ended(trail::TrailStatus::Failed, chrono::Duration::minutes(1)),
            ended(trail::TrailStatus::Failed, chrono::Duration::minutes(2)),
            ended(trail::TrailStatus::Failed, chrono::Duration::minutes(45)),
            ended(trail::TrailStatus::Succeeded, chrono::Duration::minutes(50)),
            ended(trail::TrailStatus::Failed, chrono::Duration::minutes(55)),
        ];
        assert_eq!(consecutive_failures(&trails, since), 2);
        let since = chrono::Utc::now() - chrono::Duration::days(1);
        assert_eq!(consecutive_failures(&trails, since), 3);
    }

    #[tokio::test]
    async fn sender_keeps_newest_and_current() -> anyhow::Result<()> {
        let store = trail::memory::MemoryStore::new();
        for seq in 1..=5 {
            store
                .create_snapshot("pool0", "vol1", &snapshot::snapshot_name("vol1", 7, seq))
                .await?;
        }
        store.create_snapshot("pool0", "vol1", "manual").await?;
        let deleted =
            prune_sender_snapshots(&store, &replica(), 3, "vol1_7_replication_5").await?;
        assert_eq!(deleted, vec!["vol1_7_replication_1", "vol1_7_replication_2"]);
        let left = store.snapshots("pool0", "vol1").await?;
        assert!(left.contains(&"manual".to_string()));
        assert_eq!(left.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn mirror_roll_leaves_room_for_one() -> anyhow::Result<()> {
        let store = trail::memory::MemoryStore::new();
        for seq in 1..=3 {
            store
                .create_snapshot("backup", "a_vol1", &snapshot::snapshot_name("vol1", 7, seq))
                .await?;
        }
        let left = roll_mirror_snapshots(&store, "backup", "a_vol1", 2).await?;
        assert_eq!(left, vec!["vol1_7_replication_3"]);
        let left = roll_mirror_snapshots(&store, "backup", "a_vol1", 5).await?;
        assert_eq!(left.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn old_trails_go_except_the_base() -> anyhow::Result<()> {
        let store = trail::memory::MemoryStore::new();
        store.put_replica(replica());
        let base =
            store.insert_replica_trail(ended(trail::TrailStatus::Succeeded, chrono::Duration::days(30)));
        let old_failure =
            store.insert_replica_trail(ended(trail::TrailStatus::Failed, chrono::Duration::days(20)));
        let recent =
            store.insert_replica_trail(ended(trail::TrailStatus::Failed, chrono::Duration::hours(2)));
        let mut pending = ended(trail::TrailStatus::Pending, chrono::Duration::days(20));
        pending.end_ts = None;
        let pending = store.insert_replica_trail(pending);

        let report = prune_trails(
            &store,
            std::time::Duration::from_secs(7 * 24 * 3600),
            chrono::Utc::now(),
        )
        .await?;
        assert_eq!(report.replica_trails, 1);
        let ids: Vec<_> = store
            .replica_trails(7)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![pending.id, recent.id, base.id]);
        assert!(store.replica_trail(old_failure.id).is_none());
        Ok(())
    }
}
