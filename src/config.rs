use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker substrings recognized in controller and receiver output.
pub const DEFAULT_STATISTICS_MARKERS: [&str; 4] = [
    "Dropped traces:",
    "Written traces:",
    "Trace statistics:",
    "File size:",
];

/// Top-level configuration loaded from tracecollect.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct CollectConfig {
    pub receiver: ReceiverConfig,
    pub controller: ControllerConfig,
    pub timing: TimingConfig,
    pub statistics: StatisticsConfig,
}

/// Where and how the trace receiver is started on the remote host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub host: String,
    pub user: String,
    /// Remote working directory containing the receiver binary.
    pub path: String,
    pub trace_file: String,
    pub buffer_size_gb: u32,
    pub binary: String,
    /// Prefix that runs the receiver with elevated privileges; empty to omit.
    pub privilege_command: String,
    pub ssh_program: String,
    /// Extra arguments placed before the `user@host` destination.
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller binary; defaults to `trace_controller` next to this executable.
    pub binary: Option<PathBuf>,
    pub pci_device: String,
}

/// Grace periods, poll granularity and bounded waits, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub receiver_confirm_ms: u64,
    pub controller_confirm_ms: u64,
    pub arm_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub residual_drain_ms: u64,
    pub target_grace_ms: u64,
    pub controller_grace_ms: u64,
    pub receiver_grace_ms: u64,
    pub statistics_drain_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub markers: Vec<String>,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl CollectConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Reject settings that would make a session impossible to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.host.trim().is_empty() {
            return Err(ConfigError::Invalid("receiver host is empty".into()));
        }
        if self.receiver.user.trim().is_empty() {
            return Err(ConfigError::Invalid("receiver user is empty".into()));
        }
        if self.receiver.buffer_size_gb == 0 {
            return Err(ConfigError::Invalid(
                "buffer size must be at least 1 GB".into(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll interval must be non-zero".into()));
        }
        if self.statistics.markers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one statistics marker is required".into(),
            ));
        }
        Ok(())
    }
}

impl ReceiverConfig {
    /// `user@host` destination for the remote session.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Command run on the remote host: change directory, then start the receiver.
    pub fn remote_command(&self) -> String {
        let mut launch = String::new();
        if !self.privilege_command.trim().is_empty() {
            launch.push_str(self.privilege_command.trim());
            launch.push(' ');
        }
        launch.push_str(&self.binary);
        format!(
            "cd {} && {} {} {}",
            self.path, launch, self.trace_file, self.buffer_size_gb
        )
    }
}

impl ControllerConfig {
    /// Configured binary, or `trace_controller` beside the running executable.
    pub fn resolve_binary(&self) -> PathBuf {
        if let Some(ref binary) = self.binary {
            return binary.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("trace_controller")))
            .unwrap_or_else(|| PathBuf::from("./trace_controller"))
    }
}

impl TimingConfig {
    pub fn receiver_confirm(&self) -> Duration {
        Duration::from_millis(self.receiver_confirm_ms)
    }

    pub fn controller_confirm(&self) -> Duration {
        Duration::from_millis(self.controller_confirm_ms)
    }

    pub fn arm_delay(&self) -> Duration {
        Duration::from_millis(self.arm_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn residual_drain(&self) -> Duration {
        Duration::from_millis(self.residual_drain_ms)
    }

    pub fn target_grace(&self) -> Duration {
        Duration::from_millis(self.target_grace_ms)
    }

    pub fn controller_grace(&self) -> Duration {
        Duration::from_millis(self.controller_grace_ms)
    }

    pub fn receiver_grace(&self) -> Duration {
        Duration::from_millis(self.receiver_grace_ms)
    }

    pub fn statistics_drain(&self) -> Duration {
        Duration::from_millis(self.statistics_drain_ms)
    }
}

// --- Default implementations ---

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            user: "root".to_string(),
            path: "/opt/trace".to_string(),
            trace_file: "/tmp/trace_record.bin".to_string(),
            buffer_size_gb: 10,
            binary: "./trace_receiver".to_string(),
            privilege_command: "sudo".to_string(),
            ssh_program: "ssh".to_string(),
            ssh_options: Vec::new(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            binary: None,
            pci_device: "0000:40:00.1".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            receiver_confirm_ms: 3_000,
            controller_confirm_ms: 2_000,
            arm_delay_ms: 1_000,
            poll_interval_ms: 100,
            residual_drain_ms: 1_000,
            target_grace_ms: 5_000,
            controller_grace_ms: 10_000,
            receiver_grace_ms: 15_000,
            statistics_drain_ms: 2_000,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            markers: DEFAULT_STATISTICS_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}
