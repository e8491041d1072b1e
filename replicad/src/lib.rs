//! Snapshot replication engine - `replicad`
//!
//! Propagates snapshots of a share from a source appliance to a destination
//! appliance. One long-lived [`broker`] per appliance owns two socket fabrics:
//!
//! - the network fabric, which remote [`sender`]s connect to;
//! - the local fabric, which local [`receiver`]s and task submitters connect to.
//!
//! ```text
//! appliance A                                appliance B
//! scheduler --new-send--> broker A
//!                         broker A --launch--> sender
//!                                              sender ==network==> broker B
//!                                                                  broker B --launch--> receiver
//!                                              sender <==frames relayed both ways==> receiver
//! ```
//!
//! Every session runs in isolation, either as a child process
//! ([`launcher::ProcessLauncher`]) or as a task with its own cancellation token
//! ([`launcher::TaskLauncher`]), and records its outcome in a trail through the
//! [`trail::TrailStore`] it was handed.
//!
//! # Sender
//!
//! 1. greet the remote broker and wait for `receiver-ready` (retrying on timeout)
//! 2. create the trail and the snapshot, reusing a snapshot a crashed attempt left behind
//! 3. stream the snapshot tool's output, at most `credit_window` chunks ahead of the receiver
//! 4. on `btrfs-recv-finished` prune old snapshots and mark the trail succeeded
//!
//! # Receiver
//!
//! 1. find or register the mirror share `<source-appliance>_<share>`
//! 2. answer `snap-exists` if the snapshot already landed
//! 3. otherwise promote the oldest snapshots into the live share until a slot is free and answer `receiver-ready`
//! 4. pipe data into the snapshot tool, granting `send-more` per chunk

pub mod broker;
pub mod launcher;
pub mod receiver;
pub mod retention;
pub mod sender;
pub mod snapshot;

/// Everything a session needs besides its job.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub settings: std::sync::Arc<common::EngineSettings>,
    pub store: std::sync::Arc<dyn trail::TrailStore>,
}

impl SessionContext {
    pub fn new(
        settings: std::sync::Arc<common::EngineSettings>,
        store: std::sync::Arc<dyn trail::TrailStore>,
    ) -> Self {
        Self { settings, store }
    }

    pub fn layout(&self) -> trail::layout::Layout {
        trail::layout::Layout::new(&self.settings.mount_root)
    }

    pub fn tool(&self) -> snapshot::SnapshotTool {
        snapshot::SnapshotTool::new(&self.settings.snapshot_tool)
    }
}

/// One outbound transfer, as decided by the broker's send admission.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SendJob {
    /// session address, `<appliance-id>-<replica-id>`
    pub address: String,
    pub replica: trail::Replica,
    /// network fabric of the destination broker
    pub destination: std::net::SocketAddr,
    /// newest succeeded trail, the incremental base
    pub base: Option<trail::ReplicaTrail>,
}

/// One inbound transfer, seeded with the remote sender's greeting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReceiveJob {
    pub address: String,
    pub greeting: remote::protocol::Greeting,
}

/// Builds the store a session process talks to.
pub fn connect_store(
    settings: &common::EngineSettings,
) -> anyhow::Result<std::sync::Arc<dyn trail::TrailStore>> {
    let path = settings
        .store_socket
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no administrative service socket configured"))?;
    Ok(std::sync::Arc::new(trail::client::StoreClient::new(
        path,
        settings.timeouts.reply,
    )))
}
