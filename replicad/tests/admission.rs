use replicad::launcher::{Launcher, SessionHandle};
use replicad::{ReceiveJob, SendJob};
use trail::{TrailStatus, TrailStore};

/// Records launches instead of running sessions; handles stay live until released.
#[derive(Debug, Default)]
struct RecordingLauncher {
    sends: std::sync::Mutex<Vec<SendJob>>,
    live: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingLauncher {
    fn sends(&self) -> Vec<SendJob> {
        self.sends.lock().unwrap().clone()
    }

    fn release(&self) {
        self.live.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Handle(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl SessionHandle for Handle {
    fn is_finished(&mut self) -> bool {
        !self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn abort(&mut self) {
        self.0.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Launcher for RecordingLauncher {
    fn launch_sender(&self, job: SendJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        self.sends.lock().unwrap().push(job);
        self.live.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(Box::new(Handle(self.live.clone())))
    }

    fn launch_receiver(&self, _job: ReceiveJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        anyhow::bail!("no receivers in this test")
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    store: std::sync::Arc<trail::memory::MemoryStore>,
    launcher: std::sync::Arc<RecordingLauncher>,
    cancel: tokio_util::sync::CancellationToken,
}

impl Harness {
    async fn start(max_send_attempts: usize) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut settings = common::EngineSettings::new("appliance-a");
        settings.local_socket = dir.path().join("broker.sock");
        settings.mount_root = dir.path().to_path_buf();
        settings.retention.max_send_attempts = max_send_attempts;
        let socket = settings.local_socket.clone();
        let store = std::sync::Arc::new(trail::memory::MemoryStore::new());
        store.add_appliance(trail::Appliance {
            uuid: "appliance-b".to_string(),
            ip: "127.0.0.1".parse()?,
            replication_port: 4242,
        });
        let launcher = std::sync::Arc::new(RecordingLauncher::default());
        let broker = replicad::broker::Broker::bind(
            std::sync::Arc::new(settings),
            "127.0.0.1:0".parse()?,
            store.clone(),
            launcher.clone(),
        )
        .await?;
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(broker.run(cancel.clone()));
        Ok(Self {
            _dir: dir,
            socket,
            store,
            launcher,
            cancel,
        })
    }

    async fn new_send(&self, id: trail::ReplicaId) -> anyhow::Result<Result<String, String>> {
        remote::request_send(&self.socket, id, std::time::Duration::from_secs(5)).await
    }

    fn replica(&self, id: trail::ReplicaId, dest_ip: Option<std::net::IpAddr>) {
        let replica = trail::Replica {
            id,
            share: "vol1".to_string(),
            pool: "pool0".to_string(),
            appliance: "appliance-b".to_string(),
            dest_pool: "backup".to_string(),
            dest_ip,
            enabled: true,
            ts: chrono::Utc::now(),
        };
        self.store.put_replica(replica);
    }

    fn trail(
        &self,
        id: trail::ReplicaId,
        status: TrailStatus,
        ended: chrono::Duration,
        seq: u64,
    ) -> trail::ReplicaTrail {
        let end = chrono::Utc::now() + ended;
        self.store.insert_replica_trail(trail::ReplicaTrail {
            id: 0,
            replica_id: id,
            snap_name: format!("vol1_{id}_replication_{seq}"),
            kb_sent: 10,
            send_pending: end - chrono::Duration::seconds(5),
            snapshot_created: Some(end - chrono::Duration::seconds(4)),
            end_ts: (status != TrailStatus::Pending).then_some(end),
            status,
            error: None,
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn launches_with_override_address_and_newest_success_as_base() -> anyhow::Result<()> {
    let harness = Harness::start(10).await?;
    harness.replica(1, Some("10.1.2.3".parse()?));
    let base = harness.trail(1, TrailStatus::Succeeded, chrono::Duration::hours(-3), 1);
    // failures from before the task was last edited are forgiven
    for seq in 2..20 {
        harness.trail(1, TrailStatus::Failed, chrono::Duration::hours(-2), seq);
    }
    harness.replica(1, Some("10.1.2.3".parse()?));

    let reply = harness.new_send(1).await?;
    assert!(reply.is_ok(), "{reply:?}");
    let sends = harness.launcher.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].address, "appliance-a-1");
    assert_eq!(sends[0].destination, "10.1.2.3:4242".parse()?);
    assert_eq!(sends[0].base.as_ref().map(|t| t.id), Some(base.id));
    Ok(())
}

#[tokio::test]
async fn appliance_address_is_used_without_override() -> anyhow::Result<()> {
    let harness = Harness::start(10).await?;
    harness.replica(2, None);
    harness.new_send(2).await?.map_err(anyhow::Error::msg)?;
    let sends = harness.launcher.sends();
    assert_eq!(sends[0].destination, "127.0.0.1:4242".parse()?);
    assert_eq!(sends[0].base, None);
    Ok(())
}

#[tokio::test]
async fn one_live_sender_per_task() -> anyhow::Result<()> {
    let harness = Harness::start(10).await?;
    harness.replica(1, None);
    let (first, second) = futures::join!(harness.new_send(1), harness.new_send(1));
    let replies = [first?, second?];
    assert_eq!(replies.iter().filter(|r| r.is_ok()).count(), 1, "{replies:?}");
    let refused = replies.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(refused.contains("already running"), "{refused}");

    // an exited sender no longer blocks the task
    harness.launcher.release();
    assert!(harness.new_send(1).await?.is_ok());
    assert_eq!(harness.launcher.sends().len(), 2);
    Ok(())
}

#[tokio::test]
async fn pending_trail_counts_as_a_failure_and_disables_once() -> anyhow::Result<()> {
    let harness = Harness::start(3).await?;
    harness.replica(1, None);
    harness.trail(1, TrailStatus::Failed, chrono::Duration::seconds(1), 1);
    harness.trail(1, TrailStatus::Failed, chrono::Duration::seconds(2), 1);
    let pending = harness.trail(1, TrailStatus::Pending, chrono::Duration::seconds(3), 1);

    let reply = harness.new_send(1).await?;
    let refused = reply.unwrap_err();
    assert!(refused.contains("3 consecutive failed attempts"), "{refused}");
    assert_eq!(
        harness.store.replica_trail(pending.id).unwrap().status,
        TrailStatus::Failed
    );
    assert_eq!(harness.store.disable_calls(), 1);
    assert!(!harness.store.replica(1).await?.enabled);

    let refused = harness.new_send(1).await?.unwrap_err();
    assert!(refused.contains("disabled"), "{refused}");
    assert_eq!(harness.store.disable_calls(), 1);
    assert!(harness.launcher.sends().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_task_is_refused() -> anyhow::Result<()> {
    let harness = Harness::start(10).await?;
    let refused = harness.new_send(99).await?.unwrap_err();
    assert!(refused.contains("99"), "{refused}");
    Ok(())
}
