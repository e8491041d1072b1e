//! Shared plumbing for the snaprep replication engine
//!
//! Every `replicad` process (the broker as well as the sender and receiver
//! sessions it supervises) starts through [`run`], which installs tracing and
//! builds the tokio runtime the process needs.

use rand::Rng;
use tracing::Instrument;

pub mod config;
pub mod version;

pub use config::{
    EngineSettings, LoopSettings, OutputConfig, RetentionSettings, RuntimeConfig,
    TimeoutSettings, TracingConfig,
};

/// Debug log file name: `<prefix>-<timestamp>-<random>`.
pub fn generate_debug_log_filename(prefix: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}-{timestamp}-{suffix}")
}

fn level_filter(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber: stdout always, plus an append-only debug log when requested.
///
/// `RUST_LOG` takes precedence over the verbosity flags.
pub fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_filter(output)));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
    let file_layer = match tracing_config.debug_log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("failed to open debug log {path}: {e}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Sets up tracing and a runtime, then drives `func` to completion.
///
/// Returns `None` when setup fails or `func` returns an error; the error has
/// already been reported by then, callers only need to pick an exit code.
pub fn run<F, Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: F,
) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("failed to initialize tracing: {error:#}");
        return None;
    }
    let mut builder = if runtime.current_thread {
        tokio::runtime::Builder::new_current_thread()
    } else {
        tokio::runtime::Builder::new_multi_thread()
    };
    if !runtime.current_thread && runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    let rt = match builder.enable_all().build() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!("failed to build tokio runtime: {error}");
            eprintln!("failed to build tokio runtime: {error}");
            return None;
        }
    };
    let span = tracing::info_span!("snaprep", role = %tracing_config.trace_identifier);
    match rt.block_on(func().instrument(span)) {
        Ok(result) => Some(result),
        Err(error) => {
            tracing::error!("{:#}", error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

/// Detects that the process which started us has gone away.
///
/// An orphaned process gets re-parented, so a changed parent pid is the signal.
#[derive(Debug, Clone, Copy)]
pub struct ParentWatch {
    initial: nix::unistd::Pid,
}

impl ParentWatch {
    pub fn new() -> Self {
        Self {
            initial: nix::unistd::getppid(),
        }
    }

    /// Watches for `pid` being our parent, e.g. a supervisor that handed over its pid.
    pub fn for_parent(pid: i32) -> Self {
        Self {
            initial: nix::unistd::Pid::from_raw(pid),
        }
    }

    pub fn parent_alive(&self) -> bool {
        nix::unistd::getppid() == self.initial
    }
}

impl Default for ParentWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_log_filename_has_prefix_and_suffix() {
        let a = generate_debug_log_filename("/tmp/replicad-log");
        let b = generate_debug_log_filename("/tmp/replicad-log");
        assert!(a.starts_with("/tmp/replicad-log-"));
        assert_ne!(a, b, "random suffix keeps concurrent sessions apart");
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let mut output = OutputConfig::default();
        assert_eq!(level_filter(&output), "error");
        output.verbose = 2;
        assert_eq!(level_filter(&output), "debug");
        output.verbose = 7;
        assert_eq!(level_filter(&output), "trace");
        output.quiet = true;
        assert_eq!(level_filter(&output), "off");
    }

    #[test]
    fn parent_is_alive_while_test_runs() {
        assert!(ParentWatch::new().parent_alive());
    }

    #[test]
    fn other_pid_is_not_our_parent() {
        let ours = std::process::id() as i32;
        assert!(!ParentWatch::for_parent(ours).parent_alive());
    }
}
