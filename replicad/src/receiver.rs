//! Inbound half of a transfer.
//!
//! A Receiver is launched by its broker when a remote Sender's greeting
//! arrives. It talks to that Sender only through the broker's local fabric,
//! every frame tagged with the session address.

use anyhow::Context;
use remote::protocol::{Message, ReceiverReady};
use remote::streams::{LocalRecvStream, LocalSendStream};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::{ReceiveJob, SessionContext, retention, snapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub trail_id: trail::TrailId,
    pub mirror_share: String,
    pub snap: String,
    pub bytes: u64,
    /// the snapshot was already on disk, the snapshot tool was not run
    pub already_present: bool,
}

struct Receiver<'a> {
    ctx: &'a SessionContext,
    job: ReceiveJob,
    trail: Option<trail::TrailId>,
    bytes: u64,
}

impl<'a> Receiver<'a> {
    fn new(ctx: &'a SessionContext, job: ReceiveJob) -> Self {
        Self {
            ctx,
            job,
            trail: None,
            bytes: 0,
        }
    }

    /// Sends a frame the broker acknowledges and waits for the `ACK`.
    async fn send_acked(
        &self,
        send: &mut LocalSendStream,
        recv: &mut LocalRecvStream,
        message: Message,
    ) -> anyhow::Result<()> {
        let command = message.command();
        send.send(&self.job.address, &message)
            .await
            .with_context(|| format!("failed to send {command}"))?;
        loop {
            match recv.recv_timeout(self.ctx.settings.timeouts.reply).await? {
                Some((_, Message::Ack)) => return Ok(()),
                Some((_, other)) => {
                    tracing::debug!("ignoring {} while waiting for ACK of {}", other.command(), command);
                }
                None => anyhow::bail!("broker closed the session before acknowledging {command}"),
            }
        }
    }

    /// Finds the mirror share of the greeting's source share, registering it on first contact.
    async fn resolve(&self) -> anyhow::Result<trail::ReplicaShare> {
        let greeting = &self.job.greeting;
        let store = &self.ctx.store;
        let name = snapshot::mirror_share_name(&greeting.uuid, &greeting.share);
        if let Some(rshare) = store.replica_share(&name).await? {
            return Ok(rshare);
        }
        tracing::info!("first contact from {}, creating mirror share {}", greeting.uuid, name);
        store
            .create_share(&greeting.pool, &name)
            .await
            .with_context(|| format!("failed to create mirror share {name}"))?;
        let new = trail::NewReplicaShare {
            share: name.clone(),
            pool: greeting.pool.clone(),
            appliance: greeting.uuid.clone(),
            src_share: greeting.share.clone(),
        };
        match store.create_replica_share(new).await {
            Ok(rshare) => Ok(rshare),
            // registered concurrently by an earlier session
            Err(trail::StoreError::Conflict(_)) => store
                .replica_share(&name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("mirror share {name} vanished after conflict")),
            Err(e) => Err(e).context("failed to register mirror share"),
        }
    }

    async fn refresh(&self) {
        if let Err(e) = self.ctx.store.refresh_share_state().await {
            tracing::warn!("share state refresh failed: {}", e);
        }
        if let Err(e) = self.ctx.store.refresh_snapshot_state().await {
            tracing::warn!("snapshot state refresh failed: {}", e);
        }
    }

    async fn drive(
        &mut self,
        send: &mut LocalSendStream,
        recv: &mut LocalRecvStream,
    ) -> anyhow::Result<ReceiveReport> {
        let greeting = self.job.greeting.clone();
        if !greeting.is_compatible() {
            anyhow::bail!(
                "sender protocol version {} does not match ours ({})",
                greeting.version,
                common::version::ProtocolVersion::current()
            );
        }
        greeting
            .validate()
            .map_err(|reason| anyhow::anyhow!("refusing greeting: {reason}"))?;
        let store = self.ctx.store.clone();
        let rshare = self.resolve().await?;
        if let Err(e) = store.refresh_snapshot_state().await {
            tracing::warn!("snapshot state refresh failed: {}", e);
        }
        let rtrail = store
            .create_receive_trail(rshare.id, &greeting.snap)
            .await
            .context("failed to create receive trail")?;
        self.trail = Some(rtrail.id);
        let layout = self.ctx.layout();
        let target = layout.snapshot_path(&rshare.pool, &rshare.share, &greeting.snap);
        let on_disk = tokio::fs::try_exists(&target).await.unwrap_or(false);
        // checked before rolling, a retry must find its snapshot where it landed
        let known = store
            .snapshots(&rshare.pool, &rshare.share)
            .await
            .context("failed to list mirror snapshots")?;
        if on_disk || known.contains(&greeting.snap) {
            tracing::info!("{} already received, skipping the snapshot tool", greeting.snap);
            self.send_acked(send, recv, Message::SnapExists(greeting.snap.clone()))
                .await?;
            store
                .update_receive_trail(rtrail.id, trail::TrailUpdate::Succeeded { kb: 0 })
                .await
                .context("failed to finalize receive trail")?;
            self.refresh().await;
            return Ok(ReceiveReport {
                trail_id: rtrail.id,
                mirror_share: rshare.share,
                snap: greeting.snap,
                bytes: 0,
                already_present: true,
            });
        }
        let snaps = retention::roll_mirror_snapshots(
            store.as_ref(),
            &rshare.pool,
            &rshare.share,
            self.ctx.settings.retention.receiver_retain,
        )
        .await
        .context("failed to roll mirror snapshots")?;
        let snapshot_dir = layout.snapshot_dir(&rshare.pool, &rshare.share);
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("failed to create {snapshot_dir:?}"))?;
        let mut tool = self.ctx.tool().receive(&snapshot_dir)?;
        let mut stdin = tool
            .child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("snapshot tool started without a stdin pipe"))?;
        let ready = ReceiverReady {
            latest_snapshot: snaps.last().cloned(),
        };
        self.send_acked(send, recv, Message::ReceiverReady(ready))
            .await?;
        loop {
            match recv.recv_timeout(self.ctx.settings.timeouts.reply).await? {
                Some((_, Message::Data(chunk))) => {
                    if let Err(e) = stdin.write_all(&chunk).await {
                        let stderr = tool.kill().await;
                        anyhow::bail!("snapshot tool stopped accepting data: {e} {stderr}");
                    }
                    self.bytes += chunk.len() as u64;
                    send.send(&self.job.address, &Message::SendMore)
                        .await
                        .context("failed to grant credit")?;
                }
                Some((_, Message::SendStreamFinished)) => break,
                Some((
                    _,
                    Message::SendInitError(text)
                    | Message::SendUnexpectedTermination(text)
                    | Message::SendNonzeroTermination(text),
                )) => {
                    anyhow::bail!("sender failed: {text}");
                }
                Some((_, other)) => {
                    anyhow::bail!("unexpected {} while receiving", other.command());
                }
                None => anyhow::bail!("session closed before the stream finished"),
            }
        }
        stdin.shutdown().await.ok();
        drop(stdin);
        let (status, stderr) = tool.finish().await?;
        if !status.success() {
            anyhow::bail!(snapshot::describe_exit(status, &stderr));
        }
        store
            .update_receive_trail(rtrail.id, trail::TrailUpdate::Succeeded { kb: self.bytes / 1024 })
            .await
            .context("failed to finalize receive trail")?;
        self.refresh().await;
        self.send_acked(send, recv, Message::RecvFinished).await?;
        Ok(ReceiveReport {
            trail_id: rtrail.id,
            mirror_share: rshare.share,
            snap: greeting.snap,
            bytes: self.bytes,
            already_present: false,
        })
    }

    async fn fail(&mut self, send: &mut LocalSendStream, error: &anyhow::Error) {
        let text = format!("{error:#}");
        tracing::error!("receive of {} failed: {}", self.job.greeting.snap, text);
        if let Err(e) = send
            .send(&self.job.address, &Message::ReceiverError(text.clone()))
            .await
        {
            tracing::warn!("could not report the failure upstream: {:#}", e);
        }
        if let Some(id) = self.trail {
            let update = trail::TrailUpdate::Failed {
                kb: self.bytes / 1024,
                error: text,
            };
            match self.ctx.store.update_receive_trail(id, update).await {
                Ok(()) | Err(trail::StoreError::AlreadyFinal(_)) => {}
                Err(e) => tracing::error!("failed to mark receive trail {} failed: {}", id, e),
            }
        }
    }
}

/// Runs one inbound transfer to completion and records its outcome.
///
/// Any failure is reported upstream as `receiver-error` and leaves the
/// receive trail `failed`.
#[instrument(skip_all, fields(address = %job.address))]
pub async fn run_session(
    ctx: &SessionContext,
    job: ReceiveJob,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<ReceiveReport> {
    tracing::info!(
        "receiving {} of {}:{}",
        job.greeting.snap,
        job.greeting.uuid,
        job.greeting.share
    );
    let (mut send, mut recv) =
        remote::connect_local(&ctx.settings.local_socket, ctx.settings.timeouts.connect).await?;
    let mut receiver = Receiver::new(ctx, job);
    let result = tokio::select! {
        result = receiver.drive(&mut send, &mut recv) => result,
        _ = cancel.cancelled() => Err(anyhow::anyhow!("receive cancelled, broker went away")),
    };
    match result {
        Ok(report) => {
            tracing::info!("received {} ({} KB)", report.snap, report.bytes / 1024);
            if let Err(e) = send.close().await {
                tracing::debug!("closing session: {:#}", e);
            }
            Ok(report)
        }
        Err(error) => {
            receiver.fail(&mut send, &error).await;
            Err(error)
        }
    }
}
