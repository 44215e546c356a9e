use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detection::RuleDefinition;

/// Configuration for the urlscope daemon and analyzer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Access recorder configuration
    pub recorder: RecorderConfig,
    /// Upstream event ingest configuration
    pub ingest: IngestConfig,
    /// Offline analyzer configuration
    pub analyzer: AnalyzerConfig,
}

/// Access recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Master switch; a disabled recorder ignores every event
    pub enable: bool,
    /// Path of the active log file. When empty the recorder runs in
    /// real-time only mode and nothing is persisted.
    pub log_path: PathBuf,
    /// Size in bytes above which the active file is rotated
    pub max_file_size: u64,
    /// Number of rotated backups to keep
    pub max_file_count: usize,
    /// Seconds between buffer flushes
    pub flush_interval_secs: u64,
    /// Persist the full URL in addition to the domain
    pub enable_full_url: bool,
    /// Domains that are never recorded or broadcast
    pub exclude_domains: Vec<String>,
    /// Real-time push feed
    pub realtime: RealtimeConfig,
}

/// Real-time feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enable: bool,
    /// TCP address subscribers connect to, e.g. "127.0.0.1:9999"
    pub listen_addr: String,
    /// Messages that may wait for the fan-out loop before new ones are dropped
    pub queue_capacity: usize,
    /// Seconds between heartbeats on each connection
    pub heartbeat_interval_secs: u64,
}

/// Upstream ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// UDP address that accepts JSON encoded access events
    pub listen_addr: Option<String>,
    /// Capacity of the channel between the listener and the recorder
    pub channel_capacity: usize,
}

/// Offline analyzer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Denylist file with one domain per line
    pub malicious_domains_path: Option<PathBuf>,
    /// Extra rules evaluated after the built-in ones
    pub custom_rules: Vec<RuleDefinition>,
}

impl RecorderConfig {
    /// The persisted log path, or `None` in real-time only mode
    pub fn log_file(&self) -> Option<&Path> {
        if self.log_path.as_os_str().is_empty() {
            None
        } else {
            Some(self.log_path.as_path())
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn is_excluded(&self, domain: &str) -> bool {
        self.exclude_domains.iter().any(|d| d == domain)
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            enable: false,
            log_path: PathBuf::from("/var/log/urlscope/url_access.log"),
            max_file_size: 100 * 1024 * 1024,
            max_file_count: 10,
            flush_interval_secs: 10,
            enable_full_url: false,
            exclude_domains: Vec::new(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            enable: false,
            listen_addr: "127.0.0.1:9999".to_string(),
            queue_capacity: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            listen_addr: None,
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
