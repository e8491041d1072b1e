//! External snapshot tool and replication snapshot naming.
//!
//! The tool is invoked as
//!
//! ```text
//! <tool> send [-p <base-path>] <snap-path>     stream on stdout
//! <tool> receive <snapshot-dir>                stream on stdin
//! ```

use anyhow::Context;

/// `<share>_<replica-id>_replication_<seq>`
pub fn snapshot_name(share: &str, replica_id: trail::ReplicaId, seq: u64) -> String {
    format!("{share}_{replica_id}_replication_{seq}")
}

/// Name of the snapshot the next attempt transfers.
///
/// Derived from the base trail rather than from the newest trail, so a retry
/// after a crash lands on the same name and reuses the leftover snapshot.
pub fn next_snapshot_name(replica: &trail::Replica, base: Option<&trail::ReplicaTrail>) -> String {
    let seq = base
        .and_then(|trail| trail::snapshot_seq(&trail.snap_name))
        .map_or(1, |seq| seq + 1);
    snapshot_name(&replica.share, replica.id, seq)
}

/// Whether `name` is one of the snapshots replication created for this task.
pub fn is_replication_snapshot(name: &str, share: &str, replica_id: trail::ReplicaId) -> bool {
    let prefix = format!("{share}_{replica_id}_replication_");
    name.strip_prefix(&prefix)
        .is_some_and(|seq| !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit()))
}

/// Local share mirroring `share` of appliance `appliance_id`.
pub fn mirror_share_name(appliance_id: &str, share: &str) -> String {
    format!("{appliance_id}_{share}")
}

/// A running tool process with its stderr collected in the background.
#[derive(Debug)]
pub struct ToolProcess {
    pub child: tokio::process::Child,
    stderr: Option<tokio::task::JoinHandle<String>>,
}

impl ToolProcess {
    fn new(mut child: tokio::process::Child) -> Self {
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                if let Err(e) = tokio::io::AsyncReadExt::read_to_string(&mut pipe, &mut text).await {
                    tracing::debug!("failed reading tool stderr: {}", e);
                }
                text
            })
        });
        Self { child, stderr }
    }

    /// Waits for the process and returns its exit status with whatever it printed on stderr.
    pub async fn finish(mut self) -> anyhow::Result<(std::process::ExitStatus, String)> {
        let status = self
            .child
            .wait()
            .await
            .context("failed waiting for snapshot tool")?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok((status, stderr.trim().to_string()))
    }

    /// Kills the process, used when the transfer is abandoned.
    pub async fn kill(mut self) -> String {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("failed to kill snapshot tool: {}", e);
        }
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotTool {
    program: std::path::PathBuf,
}

impl SnapshotTool {
    pub fn new(program: impl Into<std::path::PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn send_args(
        snap: &std::path::Path,
        base: Option<&std::path::Path>,
    ) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec!["send".into()];
        if let Some(base) = base {
            args.push("-p".into());
            args.push(base.into());
        }
        args.push(snap.into());
        args
    }

    /// Starts streaming `snap`, as a diff against `base` when given.
    pub fn send(
        &self,
        snap: &std::path::Path,
        base: Option<&std::path::Path>,
    ) -> anyhow::Result<ToolProcess> {
        tracing::info!("{:?} send {:?} (base: {:?})", self.program, snap, base);
        let child = tokio::process::Command::new(&self.program)
            .args(Self::send_args(snap, base))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {:?} send", self.program))?;
        Ok(ToolProcess::new(child))
    }

    /// Starts receiving a stream into `snapshot_dir`.
    pub fn receive(&self, snapshot_dir: &std::path::Path) -> anyhow::Result<ToolProcess> {
        tracing::info!("{:?} receive {:?}", self.program, snapshot_dir);
        let child = tokio::process::Command::new(&self.program)
            .arg("receive")
            .arg(snapshot_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {:?} receive", self.program))?;
        Ok(ToolProcess::new(child))
    }
}

/// Renders a failed exit for trail error text.
pub fn describe_exit(status: std::process::ExitStatus, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("snapshot tool exited with {status}")
    } else {
        format!("snapshot tool exited with {status}: {stderr}")
    }
}
