use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use replicad::launcher::{Launcher, ProcessLauncher, TaskLauncher};
use replicad::{ReceiveJob, SendJob, SessionContext};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "replicad",
    version,
    about = "Snapshot replication engine - broker and transfer sessions",
    long_about = "`replicad` propagates share snapshots between appliances.

Run one `replicad broker` per appliance. Transfers are started with `replicad send <REPLICA-ID>`, typically from a scheduler. The `sender` and `receiver` subcommands are spawned by the broker and should not be invoked manually."
)]
struct Args {
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Output")]
    quiet: bool,

    /// Also append logs to `<PREFIX>-<timestamp>-<random>`
    #[arg(long, value_name = "PREFIX", global = true, help_heading = "Output")]
    debug_log_prefix: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the per-appliance broker
    Broker(BrokerArgs),
    /// Run one outbound transfer (spawned by the broker)
    #[command(hide = true)]
    Sender(SessionArgs),
    /// Run one inbound transfer (spawned by the broker)
    #[command(hide = true)]
    Receiver(SessionArgs),
    /// Ask the local broker to start a transfer for a replication task
    Send(SendArgs),
    /// Print the protocol version as JSON
    Version,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
    /// a child process per session
    Process,
    /// a task on the broker's runtime per session
    Task,
}

#[derive(clap::Args, Debug, Clone)]
struct BrokerArgs {
    /// Engine settings file (JSON); the options below override its fields
    #[arg(long, value_name = "PATH", help_heading = "Engine settings")]
    settings: Option<std::path::PathBuf>,

    /// Identifier of this appliance, required without --settings
    #[arg(long, value_name = "UUID", help_heading = "Engine settings")]
    appliance_id: Option<String>,

    /// Unix socket of the administrative service
    #[arg(long, value_name = "PATH", help_heading = "Engine settings")]
    store_socket: Option<std::path::PathBuf>,

    /// Unix socket of the local fabric
    #[arg(long, value_name = "PATH", help_heading = "Engine settings")]
    local_socket: Option<std::path::PathBuf>,

    /// Directory pools are mounted under
    #[arg(long, value_name = "PATH", help_heading = "Engine settings")]
    mount_root: Option<std::path::PathBuf>,

    /// Snapshot tool binary
    #[arg(long, value_name = "PATH", help_heading = "Engine settings")]
    snapshot_tool: Option<std::path::PathBuf>,

    /// Address of the network fabric
    #[arg(long, default_value = "0.0.0.0:10002", value_name = "ADDR", help_heading = "Broker")]
    listen: std::net::SocketAddr,

    /// How transfer sessions are run
    #[arg(long, value_enum, default_value = "process", help_heading = "Broker")]
    sessions: SessionMode,
}

impl BrokerArgs {
    fn engine_settings(&self) -> anyhow::Result<common::EngineSettings> {
        let mut settings = match self.settings {
            Some(ref path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings file {path:?}"))?;
                common::EngineSettings::from_json(&json)?
            }
            None => {
                let id = self
                    .appliance_id
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("--appliance-id is required without --settings"))?;
                common::EngineSettings::new(id)
            }
        };
        if let Some(ref id) = self.appliance_id {
            settings.appliance_id = id.clone();
        }
        if let Some(ref path) = self.store_socket {
            settings.store_socket = Some(path.clone());
        }
        if let Some(ref path) = self.local_socket {
            settings.local_socket = path.clone();
        }
        if let Some(ref path) = self.mount_root {
            settings.mount_root = path.clone();
        }
        if let Some(ref path) = self.snapshot_tool {
            settings.snapshot_tool = path.clone();
        }
        settings
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine settings: {e}"))?;
        Ok(settings)
    }
}

#[derive(clap::Args, Debug, Clone)]
struct SessionArgs {
    /// Engine settings as JSON
    #[arg(long, value_name = "JSON")]
    settings: String,

    /// The transfer to run, as JSON
    #[arg(long, value_name = "JSON")]
    job: String,
}

#[derive(clap::Args, Debug, Clone)]
struct SendArgs {
    /// Replication task to start
    #[arg(value_name = "REPLICA-ID")]
    replica_id: u64,

    /// Unix socket of the local broker
    #[arg(long, default_value = "/run/snaprep/broker.sock", value_name = "PATH")]
    local_socket: std::path::PathBuf,

    /// How long to wait for the broker, e.g. "30s"
    #[arg(long, default_value = "30s", value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: std::time::Duration,
}

/// Resolves once stdin reaches EOF, i.e. the broker that spawned us is gone.
async fn stdin_monitor() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!("stdin closed, broker is gone - abandoning the transfer");
                return;
            }
            Ok(_) => {}
            Err(e) => match e.kind() {
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => continue,
                _ => {
                    tracing::warn!("stdin read error ({}), treating as broker exit", e);
                    return;
                }
            },
        }
    }
}

#[instrument(skip(args))]
async fn run_broker(args: BrokerArgs, verbose: u8, debug_log_prefix: Option<String>) -> anyhow::Result<()> {
    let settings = std::sync::Arc::new(args.engine_settings()?);
    let store = replicad::connect_store(&settings)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let launcher: std::sync::Arc<dyn Launcher> = match args.sessions {
        SessionMode::Process => std::sync::Arc::new(
            ProcessLauncher::current_exe(settings.clone())?.with_logging(verbose, debug_log_prefix),
        ),
        SessionMode::Task => std::sync::Arc::new(TaskLauncher::new(
            SessionContext::new(settings.clone(), store.clone()),
            cancel.clone(),
        )),
    };
    let broker = replicad::broker::Broker::bind(settings, args.listen, store, launcher)
        .await?
        .watch_parent(common::ParentWatch::new());
    tracing::info!("network fabric on {}", broker.network_addr());
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
                cancel.cancel();
            }
        }
    });
    broker.run(cancel).await
}

#[instrument(skip(args))]
async fn run_sender(args: SessionArgs) -> anyhow::Result<()> {
    let settings = std::sync::Arc::new(common::EngineSettings::from_json(&args.settings)?);
    let job: SendJob = serde_json::from_str(&args.job).context("failed to parse send job")?;
    let ctx = SessionContext::new(settings.clone(), replicad::connect_store(&settings)?);
    let cancel = tokio_util::sync::CancellationToken::new();
    let watchdog = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            stdin_monitor().await;
            cancel.cancel();
        }
    });
    let result = replicad::sender::run_session(&ctx, job, cancel).await;
    watchdog.abort();
    let report = result?;
    tracing::info!("{:?}", report);
    Ok(())
}

#[instrument(skip(args))]
async fn run_receiver(args: SessionArgs) -> anyhow::Result<()> {
    let settings = std::sync::Arc::new(common::EngineSettings::from_json(&args.settings)?);
    let job: ReceiveJob = serde_json::from_str(&args.job).context("failed to parse receive job")?;
    let ctx = SessionContext::new(settings.clone(), replicad::connect_store(&settings)?);
    let cancel = tokio_util::sync::CancellationToken::new();
    let watchdog = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            stdin_monitor().await;
            cancel.cancel();
        }
    });
    let result = replicad::receiver::run_session(&ctx, job, cancel).await;
    watchdog.abort();
    let report = result?;
    tracing::info!("{:?}", report);
    Ok(())
}

async fn run_send(args: SendArgs) -> anyhow::Result<()> {
    match remote::request_send(&args.local_socket, args.replica_id, args.timeout).await? {
        Ok(message) => {
            println!("{message}");
            Ok(())
        }
        Err(message) => Err(anyhow::anyhow!("broker refused replica {}: {}", args.replica_id, message)),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    if let Cmd::Version = args.command {
        let version = common::version::ProtocolVersion::current();
        println!("{}", version.to_json()?);
        return Ok(());
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let (identifier, current_thread) = match args.command {
        Cmd::Broker(_) => ("broker", true),
        Cmd::Sender(_) => ("sender", false),
        Cmd::Receiver(_) => ("receiver", false),
        Cmd::Send(_) | Cmd::Version => ("send", true),
    };
    let runtime = common::RuntimeConfig {
        current_thread,
        max_workers: 2,
    };
    let tracing_config = common::TracingConfig {
        debug_log_file: args
            .debug_log_prefix
            .as_deref()
            .map(common::generate_debug_log_filename),
        trace_identifier: identifier.to_string(),
    };
    let verbose = args.verbose;
    let debug_log_prefix = args.debug_log_prefix.clone();
    let res = common::run(output, runtime, tracing_config, || async move {
        match args.command {
            Cmd::Broker(broker) => run_broker(broker, verbose, debug_log_prefix).await,
            Cmd::Sender(session) => run_sender(session).await,
            Cmd::Receiver(session) => run_receiver(session).await,
            Cmd::Send(send) => run_send(send).await,
            Cmd::Version => Ok(()),
        }
    });
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
