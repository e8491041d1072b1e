//! Starting Sender and Receiver sessions.
//!
//! The broker only ever holds a [`SessionHandle`]; whether the session is a
//! child process or a task on the broker's runtime is the launcher's business.

use anyhow::Context;

use crate::{ReceiveJob, SendJob, SessionContext};

/// A live or finished session the broker tracks.
pub trait SessionHandle: Send + std::fmt::Debug {
    /// Whether the session has exited, successfully or not.
    fn is_finished(&mut self) -> bool;
    /// Asks the session to stop, used on broker shutdown.
    fn abort(&mut self);
}

pub trait Launcher: Send + Sync + std::fmt::Debug {
    fn launch_sender(&self, job: SendJob) -> anyhow::Result<Box<dyn SessionHandle>>;
    fn launch_receiver(&self, job: ReceiveJob) -> anyhow::Result<Box<dyn SessionHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Spawns `replicad sender|receiver` child processes.
///
/// Each child gets a piped stdin it never reads from but watches for EOF: when
/// the broker goes away the pipe closes and the child abandons its transfer.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: std::path::PathBuf,
    settings: std::sync::Arc<common::EngineSettings>,
    verbose: u8,
    debug_log_prefix: Option<String>,
}

impl ProcessLauncher {
    pub fn new(
        program: impl Into<std::path::PathBuf>,
        settings: std::sync::Arc<common::EngineSettings>,
    ) -> Self {
        Self {
            program: program.into(),
            settings,
            verbose: 0,
            debug_log_prefix: None,
        }
    }

    /// Launches the binary currently running.
    pub fn current_exe(settings: std::sync::Arc<common::EngineSettings>) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("failed to locate replicad binary")?;
        Ok(Self::new(program, settings))
    }

    pub fn with_logging(mut self, verbose: u8, debug_log_prefix: Option<String>) -> Self {
        self.verbose = verbose;
        self.debug_log_prefix = debug_log_prefix;
        self
    }

    pub fn command_args(&self, role: Role, job_json: &str) -> anyhow::Result<Vec<String>> {
        let mut args = vec![role.to_string()];
        if self.verbose > 0 {
            args.push(format!("-{}", "v".repeat(self.verbose as usize)));
        }
        if let Some(ref prefix) = self.debug_log_prefix {
            args.push("--debug-log-prefix".to_string());
            args.push(prefix.clone());
        }
        args.push("--settings".to_string());
        args.push(self.settings.to_json()?);
        args.push("--job".to_string());
        args.push(job_json.to_string());
        Ok(args)
    }

    fn spawn(&self, role: Role, job_json: &str) -> anyhow::Result<Box<dyn SessionHandle>> {
        let child = tokio::process::Command::new(&self.program)
            .args(self.command_args(role, job_json)?)
            .stdin(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} process {:?}", role, self.program))?;
        tracing::info!("spawned {} process {:?}", role, child.id());
        Ok(Box::new(ChildHandle { child, role }))
    }
}

impl Launcher for ProcessLauncher {
    fn launch_sender(&self, job: SendJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        let json = serde_json::to_string(&job).context("failed to serialize send job")?;
        self.spawn(Role::Sender, &json)
    }

    fn launch_receiver(&self, job: ReceiveJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        let json = serde_json::to_string(&job).context("failed to serialize receive job")?;
        self.spawn(Role::Receiver, &json)
    }
}

/// Child process; dropping it closes its stdin pipe.
#[derive(Debug)]
struct ChildHandle {
    child: tokio::process::Child,
    role: Role,
}

impl SessionHandle for ChildHandle {
    fn is_finished(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    tracing::warn!("{} process {:?} exited with {}", self.role, self.child.id(), status);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("failed to poll {} process: {}", self.role, e);
                true
            }
        }
    }

    fn abort(&mut self) {
        // closing stdin is the shutdown request
        drop(self.child.stdin.take());
    }
}

/// Runs sessions as tasks on the current runtime.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    ctx: SessionContext,
    cancel: tokio_util::sync::CancellationToken,
}

impl TaskLauncher {
    pub fn new(ctx: SessionContext, cancel: tokio_util::sync::CancellationToken) -> Self {
        Self { ctx, cancel }
    }
}

/// Session task with its own cancellation token.
#[derive(Debug)]
struct TaskHandle {
    join: tokio::task::JoinHandle<()>,
    cancel: tokio_util::sync::CancellationToken,
}

impl SessionHandle for TaskHandle {
    fn is_finished(&mut self) -> bool {
        self.join.is_finished()
    }

    fn abort(&mut self) {
        self.cancel.cancel();
    }
}

impl Launcher for TaskLauncher {
    fn launch_sender(&self, job: SendJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        let join = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let _ = crate::sender::run_session(&ctx, job, cancel).await;
            }
        });
        Ok(Box::new(TaskHandle { join, cancel }))
    }

    fn launch_receiver(&self, job: ReceiveJob) -> anyhow::Result<Box<dyn SessionHandle>> {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        let join = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let _ = crate::receiver::run_session(&ctx, job, cancel).await;
            }
        });
        Ok(Box::new(TaskHandle { join, cancel }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_arguments_carry_settings_and_job() -> anyhow::Result<()> {
        let settings = std::sync::Arc::new(common::EngineSettings::new("appliance-a"));
        let launcher = ProcessLauncher::new("/usr/bin/replicad", settings.clone())
            .with_logging(2, Some("/tmp/replicad-log".to_string()));
        let args = launcher.command_args(Role::Receiver, "{\"address\":\"x\"}")?;
        assert_eq!(args[0], "receiver");
        assert_eq!(args[1], "-vv");
        assert_eq!(args[2..4], ["--debug-log-prefix", "/tmp/replicad-log"]);
        let at = args.iter().position(|a| a == "--settings").unwrap();
        assert_eq!(
            common::EngineSettings::from_json(&args[at + 1])?,
            *settings
        );
        assert_eq!(args.last().unwrap(), "{\"address\":\"x\"}");
        Ok(())
    }

    #[tokio::test]
    async fn child_handle_notices_exit() -> anyhow::Result<()> {
        let child = tokio::process::Command::new("true")
            .stdin(std::process::Stdio::piped())
            .spawn()?;
        let mut handle = ChildHandle {
            child,
            role: Role::Sender,
        };
        for _ in 0..100 {
            if handle.is_finished() {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        anyhow::bail!("child never reported finished")
    }
}
