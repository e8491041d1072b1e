//! Outbound half of a transfer.
//!
//! A Sender greets the destination broker, snapshots the share, streams the
//! snapshot tool's output chunk by chunk under the receiver's credit, and
//! records the outcome in a [`trail::ReplicaTrail`]. Whatever goes wrong, the
//! trail ends up `failed` with the full error chain as its text.

use anyhow::Context;
use remote::protocol::{Greeting, Message, ReceiverReady};
use remote::streams::{NetworkRecvStream, NetworkSendStream};
use tracing::instrument;

use crate::{SendJob, SessionContext, retention, snapshot};

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub trail_id: trail::TrailId,
    pub snap: String,
    /// snapshot the stream was a diff against, `None` for a full stream
    pub base: Option<String>,
    pub bytes: u64,
    /// the destination already held the snapshot, nothing was streamed
    pub already_present: bool,
}

enum Greeted {
    Ready(ReceiverReady),
    Exists(String),
}

struct Sender<'a> {
    ctx: &'a SessionContext,
    job: SendJob,
    snap: String,
    trail: Option<trail::TrailId>,
    bytes: u64,
}

impl<'a> Sender<'a> {
    fn new(ctx: &'a SessionContext, job: SendJob) -> Self {
        let snap = snapshot::next_snapshot_name(&job.replica, job.base.as_ref());
        Self {
            ctx,
            job,
            snap,
            trail: None,
            bytes: 0,
        }
    }

    fn kb(&self) -> u64 {
        self.bytes / 1024
    }

    async fn notify(&self, send: &mut NetworkSendStream, message: Message) {
        if let Err(e) = send.send(&self.job.address, &message).await {
            tracing::warn!("failed to notify receiver ({}): {:#}", message.command(), e);
        }
    }

    /// Connects and greets until the receiver answers, reconnecting on timeout.
    async fn greet(&self) -> anyhow::Result<(NetworkSendStream, NetworkRecvStream, Greeted)> {
        let settings = &self.ctx.settings;
        let timeouts = &settings.timeouts;
        let replica = &self.job.replica;
        let greeting = Message::SenderReady(Greeting::new(
            &replica.dest_pool,
            &replica.share,
            &self.snap,
            self.job.base.is_some(),
            &settings.appliance_id,
        ));
        let destination = self.job.destination;
        let mut last_error = anyhow::anyhow!("no greeting attempted");
        for attempt in 1..=timeouts.greeting_attempts {
            tracing::debug!(
                "greeting {} (attempt {}/{})",
                destination,
                attempt,
                timeouts.greeting_attempts
            );
            let (mut send, mut recv) =
                match remote::connect_network(destination, timeouts.connect).await {
                    Ok(streams) => streams,
                    Err(e) => {
                        tracing::warn!("attempt {}: {:#}", attempt, e);
                        last_error = e;
                        tokio::time::sleep(timeouts.greeting).await;
                        continue;
                    }
                };
            if let Err(e) = send.send(&self.job.address, &greeting).await {
                tracing::warn!("attempt {}: failed to send greeting: {:#}", attempt, e);
                last_error = e;
                continue;
            }
            match recv.recv_timeout(timeouts.greeting).await {
                Ok(Some((_, Message::ReceiverReady(ready)))) => {
                    return Ok((send, recv, Greeted::Ready(ready)));
                }
                Ok(Some((_, Message::SnapExists(name)))) => {
                    return Ok((send, recv, Greeted::Exists(name)));
                }
                Ok(Some((_, Message::ReceiverError(text)))) => {
                    anyhow::bail!("receiver refused {}: {}", self.snap, text);
                }
                Ok(Some((_, Message::ReceiverInitError(text)))) => {
                    anyhow::bail!("{} could not start a receiver: {}", destination, text);
                }
                Ok(Some((_, other))) => {
                    anyhow::bail!("unexpected reply to greeting: {}", other.command());
                }
                Ok(None) => {
                    tracing::warn!("attempt {}: {} closed the connection", attempt, destination);
                    last_error = anyhow::anyhow!("{destination} closed the connection");
                }
                Err(e) => {
                    tracing::warn!("attempt {}: {:#}", attempt, e);
                    last_error = e;
                }
            }
        }
        Err(last_error).with_context(|| {
            format!(
                "no receiver-ready from {} after {} attempts",
                destination, timeouts.greeting_attempts
            )
        })
    }

    /// Picks the diff base, preferring what the receiver says it holds.
    async fn diff_base(&self, ready: &ReceiverReady) -> anyhow::Result<Option<String>> {
        let own = self.job.base.as_ref().map(|t| t.snap_name.clone());
        let Some(ref theirs) = ready.latest_snapshot else {
            if own.is_some() {
                tracing::info!("receiver holds no snapshot of this share, sending a full stream");
            }
            return Ok(None);
        };
        if own.as_ref() == Some(theirs) || *theirs == self.snap {
            return Ok(own);
        }
        let replica = &self.job.replica;
        let local = self
            .ctx
            .store
            .snapshots(&replica.pool, &replica.share)
            .await
            .context("failed to list local snapshots")?;
        if local.contains(theirs) {
            tracing::info!(
                "receiver's newest snapshot {} differs from trail base {:?}, using it",
                theirs,
                own
            );
            Ok(Some(theirs.clone()))
        } else {
            Ok(own)
        }
    }

    async fn wait_credit(&self, recv: &mut NetworkRecvStream) -> anyhow::Result<()> {
        match recv.recv_timeout(self.ctx.settings.timeouts.reply).await? {
            Some((_, Message::SendMore)) => Ok(()),
            Some((_, Message::ReceiverError(text))) => {
                anyhow::bail!("receiver failed while streaming: {text}")
            }
            Some((_, other)) => {
                anyhow::bail!("unexpected {} while waiting for send-more", other.command())
            }
            None => anyhow::bail!("connection closed while streaming"),
        }
    }

    async fn stream(
        &mut self,
        send: &mut NetworkSendStream,
        recv: &mut NetworkRecvStream,
        base: Option<&str>,
    ) -> anyhow::Result<()> {
        let replica = &self.job.replica;
        let layout = self.ctx.layout();
        let snap_path = layout.snapshot_path(&replica.pool, &replica.share, &self.snap);
        let base_path = base.map(|b| layout.snapshot_path(&replica.pool, &replica.share, b));
        let mut tool = match self.ctx.tool().send(&snap_path, base_path.as_deref()) {
            Ok(tool) => tool,
            Err(e) => {
                self.notify(send, Message::SendInitError(format!("{e:#}")))
                    .await;
                return Err(e);
            }
        };
        let Some(mut stdout) = tool.child.stdout.take() else {
            self.notify(send, Message::SendInitError("no stdout pipe".to_string()))
                .await;
            anyhow::bail!("snapshot tool started without a stdout pipe");
        };
        let chunk_size = self.ctx.settings.chunk_size;
        let mut credits = self.ctx.settings.credit_window;
        let mut buf = bytes::BytesMut::with_capacity(chunk_size);
        loop {
            buf.reserve(chunk_size);
            let mut limited = tokio::io::AsyncReadExt::take(&mut stdout, chunk_size as u64);
            let n = match tokio::io::AsyncReadExt::read_buf(&mut limited, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let stderr = tool.kill().await;
                    let text = format!("failed reading snapshot stream: {e} {stderr}");
                    self.notify(send, Message::SendUnexpectedTermination(text.clone()))
                        .await;
                    anyhow::bail!(text);
                }
            };
            if n == 0 {
                break;
            }
            if credits == 0 {
                self.wait_credit(recv).await?;
                credits += 1;
            }
            let chunk = buf.split().freeze();
            send.send(&self.job.address, &Message::Data(chunk))
                .await
                .context("failed to forward snapshot data")?;
            credits -= 1;
            self.bytes += n as u64;
        }
        let (status, stderr) = tool.finish().await?;
        if !status.success() {
            let text = snapshot::describe_exit(status, &stderr);
            self.notify(send, Message::SendNonzeroTermination(text.clone()))
                .await;
            anyhow::bail!(text);
        }
        tracing::info!("streamed {} bytes of {}", self.bytes, self.snap);
        send.send(&self.job.address, &Message::SendStreamFinished)
            .await
            .context("failed to send stream-finished")?;
        Ok(())
    }

    async fn await_received(&self, recv: &mut NetworkRecvStream) -> anyhow::Result<()> {
        loop {
            match recv.recv_timeout(self.ctx.settings.timeouts.reply).await? {
                // credit granted for the last chunks
                Some((_, Message::SendMore)) => continue,
                Some((_, Message::RecvFinished)) => return Ok(()),
                Some((_, Message::ReceiverError(text))) => {
                    anyhow::bail!("receiver failed to store {}: {}", self.snap, text)
                }
                Some((_, other)) => {
                    anyhow::bail!("unexpected {} while waiting for receive to finish", other.command())
                }
                None => anyhow::bail!("connection closed before receive finished"),
            }
        }
    }

    /// Applies sender-side retention. Errors are logged, the transfer still counts.
    async fn prune(&self) {
        match retention::prune_sender_snapshots(
            self.ctx.store.as_ref(),
            &self.job.replica,
            self.ctx.settings.retention.sender_retain,
            &self.snap,
        )
        .await
        {
            Ok(deleted) if !deleted.is_empty() => {
                tracing::debug!("retention removed {:?}", deleted);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("snapshot retention failed: {}", e),
        }
    }

    async fn drive(&mut self) -> anyhow::Result<SendReport> {
        let store = self.ctx.store.clone();
        let replica = self.job.replica.clone();
        let (mut send, mut recv, greeted) = self.greet().await?;
        let ready = match greeted {
            Greeted::Ready(ready) => ready,
            Greeted::Exists(name) => {
                tracing::info!("{} already present at the destination", name);
                let trail = store
                    .create_replica_trail(replica.id, &self.snap)
                    .await
                    .context("failed to create replica trail")?;
                self.trail = Some(trail.id);
                self.prune().await;
                store
                    .update_replica_trail(trail.id, trail::TrailUpdate::Succeeded { kb: 0 })
                    .await
                    .context("failed to finalize replica trail")?;
                return Ok(SendReport {
                    trail_id: trail.id,
                    snap: self.snap.clone(),
                    base: None,
                    bytes: 0,
                    already_present: true,
                });
            }
        };
        let trail = store
            .create_replica_trail(replica.id, &self.snap)
            .await
            .context("failed to create replica trail")?;
        self.trail = Some(trail.id);
        let created = store
            .create_snapshot(&replica.pool, &replica.share, &self.snap)
            .await
            .with_context(|| format!("failed to create snapshot {}", self.snap))?;
        if !created {
            tracing::info!("reusing snapshot {} left by an earlier attempt", self.snap);
        }
        store
            .update_replica_trail(trail.id, trail::TrailUpdate::SnapshotCreated)
            .await
            .context("failed to update replica trail")?;
        let base = self.diff_base(&ready).await?;
        self.stream(&mut send, &mut recv, base.as_deref()).await?;
        self.await_received(&mut recv).await?;
        self.prune().await;
        store
            .update_replica_trail(trail.id, trail::TrailUpdate::Succeeded { kb: self.kb() })
            .await
            .context("failed to finalize replica trail")?;
        if let Err(e) = send.close().await {
            tracing::debug!("closing connection: {:#}", e);
        }
        Ok(SendReport {
            trail_id: trail.id,
            snap: self.snap.clone(),
            base,
            bytes: self.bytes,
            already_present: false,
        })
    }

    /// Records `error` in the trail, creating one if the attempt failed before it had any.
    async fn fail(&mut self, error: &anyhow::Error) {
        let text = format!("{error:#}");
        tracing::error!("send of {} failed: {}", self.snap, text);
        let store = &self.ctx.store;
        let id = match self.trail {
            Some(id) => id,
            None => match store
                .create_replica_trail(self.job.replica.id, &self.snap)
                .await
            {
                Ok(trail) => trail.id,
                Err(e) => {
                    tracing::error!("failed to record failed attempt: {}", e);
                    return;
                }
            },
        };
        let update = trail::TrailUpdate::Failed {
            kb: self.kb(),
            error: text,
        };
        match store.update_replica_trail(id, update).await {
            Ok(()) | Err(trail::StoreError::AlreadyFinal(_)) => {}
            Err(e) => tracing::error!("failed to mark trail {} failed: {}", id, e),
        }
    }
}

/// Runs one outbound transfer to completion and records its outcome.
///
/// Returns an error, after marking the trail `failed`, if anything went wrong
/// or `cancel` fired first.
#[instrument(skip_all, fields(address = %job.address))]
pub async fn run_session(
    ctx: &SessionContext,
    job: SendJob,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<SendReport> {
    let mut sender = Sender::new(ctx, job);
    tracing::info!(
        "sending {} to {} (base: {:?})",
        sender.snap,
        sender.job.destination,
        sender.job.base.as_ref().map(|t| &t.snap_name)
    );
    let result = tokio::select! {
        result = sender.drive() => result,
        _ = cancel.cancelled() => Err(anyhow::anyhow!("send cancelled, broker went away")),
    };
    match result {
        Ok(report) => {
            tracing::info!(
                "sent {} ({} KB, base {:?})",
                report.snap,
                report.bytes / 1024,
                report.base
            );
            Ok(report)
        }
        Err(error) => {
            sender.fail(&error).await;
            Err(error)
        }
    }
}
