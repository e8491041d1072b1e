//! Records owned by the administrative service.

use serde::{Deserialize, Serialize};

pub type ReplicaId = u64;
pub type TrailId = u64;
pub type ReplicaShareId = u64;
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A peer appliance replication traffic can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appliance {
    pub uuid: String,
    pub ip: std::net::IpAddr,
    /// network fabric port of the appliance's broker
    pub replication_port: u16,
}

/// A replication task: send snapshots of `pool/share` to `appliance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub share: String,
    pub pool: String,
    /// destination appliance identity
    pub appliance: String,
    pub dest_pool: String,
    /// overrides the destination appliance's registered address
    pub dest_ip: Option<std::net::IpAddr>,
    pub enabled: bool,
    /// last modification of the task definition
    pub ts: Timestamp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TrailStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TrailStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TrailStatus::Pending)
    }
}

/// One outbound attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaTrail {
    pub id: TrailId,
    pub replica_id: ReplicaId,
    pub snap_name: String,
    pub kb_sent: u64,
    pub send_pending: Timestamp,
    pub snapshot_created: Option<Timestamp>,
    pub end_ts: Option<Timestamp>,
    pub status: TrailStatus,
    pub error: Option<String>,
}

/// Local mirror of a remote share, registered on first inbound contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaShare {
    pub id: ReplicaShareId,
    /// local mirror share name
    pub share: String,
    pub pool: String,
    /// remote appliance the data comes from
    pub appliance: String,
    /// share name on the remote appliance
    pub src_share: String,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReplicaShare {
    pub share: String,
    pub pool: String,
    pub appliance: String,
    pub src_share: String,
}

/// One inbound attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTrail {
    pub id: TrailId,
    pub rshare_id: ReplicaShareId,
    pub snap_name: String,
    pub kb_received: u64,
    pub receive_pending: Timestamp,
    pub end_ts: Option<Timestamp>,
    pub status: TrailStatus,
    pub error: Option<String>,
}

/// Milestones a trail moves through. Terminal updates are accepted exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailUpdate {
    SnapshotCreated,
    Succeeded { kb: u64 },
    Failed { kb: u64, error: String },
}

/// Trailing sequence number of a replication snapshot name (`vol1_7_replication_12` -> 12).
pub fn snapshot_seq(name: &str) -> Option<u64> {
    name.rsplit_once('_')
        .and_then(|(_, seq)| seq.parse().ok())
}

/// Orders snapshot names oldest first: by sequence number, then by name.
pub fn sort_snapshots(names: &mut [String]) {
    names.sort_by(|a, b| {
        snapshot_seq(a)
            .cmp(&snapshot_seq(b))
            .then_with(|| a.cmp(b))
    });
}
