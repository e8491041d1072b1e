#![allow(dead_code)]

use trail::TrailStore;

/// Stands in for btrfs: `send` emits the snapshot name on one line followed by
/// zero bytes, `receive` creates the named snapshot directory and stores the
/// rest of its input there. Every invocation is appended to `calls.log`.
const FAKE_TOOL: &str = r#"#!/bin/sh
set -e
dir=$(dirname "$0")
echo "$@" >> "$dir/calls.log"
case "$1" in
send)
    if [ -e "$dir/fail_send" ]; then
        echo "simulated send failure" >&2
        exit 3
    fi
    for last; do :; done
    basename "$last"
    head -c "$(cat "$dir/send_bytes")" /dev/zero
    ;;
receive)
    IFS= read -r name
    mkdir -p "$2/$name"
    cat > "$2/$name/stream"
    ;;
*)
    echo "unknown command $1" >&2
    exit 2
    ;;
esac
"#;

/// Writes the fake snapshot tool into `dir`, where [`test_settings`] expects it.
pub fn install_fake_tool(dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let tool = dir.join("fake-btrfs");
    std::fs::write(&tool, FAKE_TOOL)?;
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))?;
    std::fs::write(dir.join("send_bytes"), "65536")?;
    Ok(tool)
}

pub const SHARE: &str = "vol1";
pub const POOL: &str = "pool0";
pub const DEST_POOL: &str = "backup";

#[derive(Debug)]
pub struct Node {
    pub settings: std::sync::Arc<common::EngineSettings>,
    pub store: std::sync::Arc<trail::memory::MemoryStore>,
    pub network_addr: std::net::SocketAddr,
}

impl Node {
    pub fn mount_root(&self) -> &std::path::Path {
        &self.settings.mount_root
    }
}

/// Two appliances, `appliance-a` replicating to `appliance-b`, each with its
/// own broker running sessions as tasks.
#[derive(Debug)]
pub struct Cluster {
    pub dir: tempfile::TempDir,
    pub a: Node,
    pub b: Node,
    cancel: tokio_util::sync::CancellationToken,
}

pub fn test_settings(
    dir: &std::path::Path,
    id: &str,
    tweak: &impl Fn(&mut common::EngineSettings),
) -> common::EngineSettings {
    let mut settings = common::EngineSettings::new(id);
    settings.mount_root = dir.join(id);
    settings.snapshot_tool = dir.join("fake-btrfs");
    settings.local_socket = dir.join(format!("{id}.sock"));
    settings.chunk_size = 16 * 1024;
    settings.timeouts.connect = std::time::Duration::from_secs(2);
    settings.timeouts.greeting = std::time::Duration::from_secs(5);
    settings.timeouts.greeting_attempts = 2;
    settings.timeouts.reply = std::time::Duration::from_secs(10);
    settings.event_loop.poll_interval = std::time::Duration::from_millis(50);
    settings.event_loop.idle_iterations = 2;
    tweak(&mut settings);
    settings
}

async fn start_node(
    settings: common::EngineSettings,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<Node> {
    std::fs::create_dir_all(&settings.mount_root)?;
    let settings = std::sync::Arc::new(settings);
    let store = std::sync::Arc::new(trail::memory::MemoryStore::with_mount_root(
        &settings.mount_root,
    ));
    let dyn_store: std::sync::Arc<dyn trail::TrailStore> = store.clone();
    let launcher = std::sync::Arc::new(replicad::launcher::TaskLauncher::new(
        replicad::SessionContext::new(settings.clone(), dyn_store.clone()),
        cancel.clone(),
    ));
    let broker = replicad::broker::Broker::bind(
        settings.clone(),
        "127.0.0.1:0".parse()?,
        dyn_store,
        launcher,
    )
    .await?;
    let network_addr = broker.network_addr();
    tokio::spawn(broker.run(cancel.clone()));
    Ok(Node {
        settings,
        store,
        network_addr,
    })
}

impl Cluster {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl Fn(&mut common::EngineSettings)) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        install_fake_tool(dir.path())?;
        let cancel = tokio_util::sync::CancellationToken::new();
        let a = start_node(test_settings(dir.path(), "appliance-a", &tweak), &cancel).await?;
        let b = start_node(test_settings(dir.path(), "appliance-b", &tweak), &cancel).await?;
        a.store.add_appliance(trail::Appliance {
            uuid: "appliance-b".to_string(),
            ip: b.network_addr.ip(),
            replication_port: b.network_addr.port(),
        });
        a.store.create_share(POOL, SHARE).await?;
        Ok(Self { dir, a, b, cancel })
    }

    /// Registers replication task `id` of `vol1` on appliance-a.
    pub fn add_replica(&self, id: trail::ReplicaId) -> trail::Replica {
        let replica = replica(id);
        self.a.store.put_replica(replica.clone());
        replica
    }

    /// Stops both brokers, cancelling every session they run.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn set_send_bytes(&self, bytes: usize) -> anyhow::Result<()> {
        std::fs::write(self.dir.path().join("send_bytes"), bytes.to_string())?;
        Ok(())
    }

    pub fn fail_sends(&self) -> anyhow::Result<()> {
        std::fs::write(self.dir.path().join("fail_send"), "")?;
        Ok(())
    }

    /// Lines of the fake tool's invocation log.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Asks appliance-a's broker to start task `id`.
    pub async fn send(&self, id: trail::ReplicaId) -> anyhow::Result<Result<String, String>> {
        remote::request_send(
            &self.a.settings.local_socket,
            id,
            std::time::Duration::from_secs(10),
        )
        .await
    }

    /// Waits until task `id` has `count` trails and the newest is final.
    pub async fn wait_for_send(
        &self,
        id: trail::ReplicaId,
        count: usize,
    ) -> anyhow::Result<trail::ReplicaTrail> {
        for _ in 0..600 {
            let trails = self.a.store.replica_trails(id).await?;
            if trails.len() >= count && trails[0].status.is_final() {
                return Ok(trails[0].clone());
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        anyhow::bail!("send of task {id} did not finish")
    }

    /// Waits until the mirror share has `count` receive trails and the newest is final.
    pub async fn wait_for_receive(&self, count: usize) -> anyhow::Result<trail::ReceiveTrail> {
        for _ in 0..600 {
            if let Some(rshare) = self.b.store.replica_share(&mirror_share()).await? {
                let trails = self.b.store.receive_trails(rshare.id).await?;
                if trails.len() >= count && trails[0].status.is_final() {
                    return Ok(trails[0].clone());
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        anyhow::bail!("receive did not finish")
    }

    /// Sends task `id` once more and waits for both trails to settle.
    pub async fn replicate(
        &self,
        id: trail::ReplicaId,
        attempt: usize,
    ) -> anyhow::Result<(trail::ReplicaTrail, trail::ReceiveTrail)> {
        let reply = self.send(id).await?;
        anyhow::ensure!(reply.is_ok(), "new-send refused: {reply:?}");
        let sent = self.wait_for_send(id, attempt).await?;
        let received = self.wait_for_receive(attempt).await?;
        Ok((sent, received))
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Task `id` replicating `vol1` of appliance-a to appliance-b.
pub fn replica(id: trail::ReplicaId) -> trail::Replica {
    trail::Replica {
        id,
        share: SHARE.to_string(),
        pool: POOL.to_string(),
        appliance: "appliance-b".to_string(),
        dest_pool: DEST_POOL.to_string(),
        dest_ip: None,
        enabled: true,
        ts: chrono::Utc::now(),
    }
}

/// Destination side of a transfer that accepts the greeting, then grants
/// `send-more` only when asked to.
pub struct StingyReceiver {
    send: remote::streams::NetworkSendStream,
    recv: remote::streams::NetworkRecvStream,
    pub address: String,
}

impl StingyReceiver {
    pub async fn accept(listener: &tokio::net::TcpListener) -> anyhow::Result<Self> {
        let wait = std::time::Duration::from_secs(10);
        let (stream, _) = tokio::time::timeout(wait, listener.accept()).await??;
        let (mut send, mut recv) = remote::network_streams(stream)?;
        let (address, message) = recv
            .recv_timeout(wait)
            .await?
            .ok_or_else(|| anyhow::anyhow!("sender hung up before greeting"))?;
        anyhow::ensure!(
            matches!(message, remote::protocol::Message::SenderReady(_)),
            "expected a greeting, got {message:?}"
        );
        let ready = remote::protocol::ReceiverReady::default();
        send.send(&address, &remote::protocol::Message::ReceiverReady(ready))
            .await?;
        Ok(Self {
            send,
            recv,
            address,
        })
    }

    /// Counts data chunks until none arrives for `quiet`.
    pub async fn chunks_until_quiet(&mut self, quiet: std::time::Duration) -> anyhow::Result<usize> {
        let mut chunks = 0;
        loop {
            match tokio::time::timeout(quiet, self.recv.recv()).await {
                Err(_) => return Ok(chunks),
                Ok(Ok(Some((_, remote::protocol::Message::Data(_))))) => chunks += 1,
                Ok(other) => anyhow::bail!("expected data, got {other:?}"),
            }
        }
    }

    pub async fn grant(&mut self) -> anyhow::Result<()> {
        self.send
            .send(&self.address, &remote::protocol::Message::SendMore)
            .await
    }
}

pub fn mirror_share() -> String {
    format!("appliance-a_{SHARE}")
}

/// KB the fake tool's stream for `snap` carries.
pub fn stream_kb(snap: &str, bytes: usize) -> u64 {
    ((snap.len() + 1 + bytes) / 1024) as u64
}
