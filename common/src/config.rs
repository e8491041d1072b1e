//! Configuration types for runtime, logging and replication settings

use serde::{Deserialize, Serialize};

/// Runtime configuration for tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Run everything on a single thread (the broker's event loop)
    pub current_thread: bool,
    /// Number of worker threads (0 = number of CPU cores), ignored for current-thread runtimes
    pub max_workers: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Tracing configuration for debugging
#[derive(Debug, Default)]
pub struct TracingConfig {
    /// Debug log file path
    pub debug_log_file: Option<String>,
    /// Name stamped on every line written to the debug log (e.g. "broker", "receiver")
    pub trace_identifier: String,
}

/// Serde adapter storing durations as human readable strings ("10s", "1h 30m").
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &std::time::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<std::time::Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Timeouts applied to every blocking wait on a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSettings {
    /// TCP connect timeout for the network fabric
    #[serde(with = "human_duration")]
    pub connect: std::time::Duration,
    /// How long a Sender waits for the reply to its greeting before reconnecting
    #[serde(with = "human_duration")]
    pub greeting: std::time::Duration,
    /// Number of greeting attempts before the Sender gives up
    pub greeting_attempts: u32,
    /// How long either side waits for any other peer reply (credit, acknowledgement)
    #[serde(with = "human_duration")]
    pub reply: std::time::Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: std::time::Duration::from_secs(15),
            greeting: std::time::Duration::from_secs(6),
            greeting_attempts: 10,
            reply: std::time::Duration::from_secs(60),
        }
    }
}

/// Retention and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionSettings {
    /// Replication snapshots kept on the sending side
    pub sender_retain: usize,
    /// Successfully received snapshots kept per mirror share
    pub receiver_retain: usize,
    /// Consecutive failed attempts before a Replica gets disabled
    pub max_send_attempts: usize,
    /// Terminal trails older than this are deleted
    #[serde(with = "human_duration")]
    pub trail_window: std::time::Duration,
    /// Minimum time between two trail pruning passes
    #[serde(with = "human_duration")]
    pub prune_interval: std::time::Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            sender_retain: 3,
            receiver_retain: 5,
            max_send_attempts: 10,
            trail_window: std::time::Duration::from_secs(7 * 24 * 60 * 60),
            prune_interval: std::time::Duration::from_secs(60 * 60),
        }
    }
}

/// Broker event loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopSettings {
    /// Bounded wait before an idle tick fires
    #[serde(with = "human_duration")]
    pub poll_interval: std::time::Duration,
    /// Idle ticks between two session prune passes
    pub idle_iterations: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(6),
            idle_iterations: 10,
        }
    }
}

/// Everything a Broker, Sender or Receiver needs to know about the local appliance.
///
/// Children spawned by the broker receive this as JSON so both sides agree on
/// every value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Identity of the local appliance
    pub appliance_id: String,
    /// Where pools are mounted, snapshots live under `<mount_root>/<pool>/.snapshots`
    pub mount_root: std::path::PathBuf,
    /// Path of the external snapshot send/receive tool
    pub snapshot_tool: std::path::PathBuf,
    /// Local fabric endpoint (Unix socket) the broker listens on
    pub local_socket: std::path::PathBuf,
    /// Administrative service endpoint, `None` when the store lives in-process
    pub store_socket: Option<std::path::PathBuf>,
    /// Largest data chunk forwarded in one frame
    pub chunk_size: usize,
    /// Data chunks a Sender may have in flight before waiting for `send-more`
    pub credit_window: usize,
    pub timeouts: TimeoutSettings,
    pub retention: RetentionSettings,
    #[serde(rename = "loop")]
    pub event_loop: LoopSettings,
}

impl EngineSettings {
    pub fn new(appliance_id: impl Into<String>) -> Self {
        Self {
            appliance_id: appliance_id.into(),
            mount_root: std::path::PathBuf::from("/mnt2"),
            snapshot_tool: std::path::PathBuf::from("/usr/sbin/btrfs"),
            local_socket: std::path::PathBuf::from("/run/snaprep/broker.sock"),
            store_socket: None,
            chunk_size: 1024 * 1024,
            credit_window: 1,
            timeouts: TimeoutSettings::default(),
            retention: RetentionSettings::default(),
            event_loop: LoopSettings::default(),
        }
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.appliance_id.is_empty() {
            return Err("appliance id must not be empty".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1 byte".to_string());
        }
        if self.credit_window == 0 {
            return Err("credit_window must be at least 1".to_string());
        }
        if self.timeouts.greeting_attempts == 0 {
            return Err("greeting_attempts must be at least 1".to_string());
        }
        if self.retention.receiver_retain == 0 || self.retention.sender_retain == 0 {
            return Err("retention counts must be at least 1".to_string());
        }
        if self.event_loop.idle_iterations == 0 {
            return Err("idle_iterations must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize engine settings: {:#}", e))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("failed to parse engine settings JSON: {:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_survive_json() {
        let mut settings = EngineSettings::new("appliance-a");
        settings.store_socket = Some("/run/snaprep/store.sock".into());
        settings.timeouts.greeting = std::time::Duration::from_millis(250);
        let json = settings.to_json().unwrap();
        assert!(json.contains("\"250ms\""), "durations are human readable: {json}");
        assert_eq!(EngineSettings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut settings = EngineSettings::new("appliance-a");
        assert!(settings.validate().is_ok());
        settings.credit_window = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn durations_parse_from_humantime() {
        let json = EngineSettings::new("x")
            .to_json()
            .unwrap()
            .replace("\"7days\"", "\"2h\"");
        let settings = EngineSettings::from_json(&json).unwrap();
        assert_eq!(
            settings.retention.trail_window,
            std::time::Duration::from_secs(2 * 60 * 60)
        );
    }
}
