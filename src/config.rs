//! Configuration types for usenet-fs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// NNTP server configuration
///
/// Immutable between reconfigurations; the multi-server client snapshots the
/// full list at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identifier used in health stats and logs
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    pub tls: bool,

    /// Username for authentication
    pub user: Option<String>,

    /// Password for authentication
    pub pass: Option<String>,

    /// Number of connections to maintain
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Server priority (lower = tried first, for backup servers)
    #[serde(default)]
    pub priority: i32,

    /// Whether this server participates in routing
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Advertised retention in days (informational)
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Queue/pipeline behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connections the job pipeline may use; the remainder of each server's
    /// capacity is reserved for live read traffic (default: 2)
    #[serde(default = "default_max_queue_connections")]
    pub max_queue_connections: usize,

    /// What to do when a job's mount folder already exists
    #[serde(default)]
    pub duplicate_nzb_behavior: DuplicateNzbBehavior,

    /// Delay applied when a job is deferred by a transient failure
    /// (default: 60 seconds)
    #[serde(default = "default_defer_delay", with = "duration_secs")]
    pub defer_delay: Duration,

    /// Sleep between queue polls when no job is eligible (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_connections: default_max_queue_connections(),
            duplicate_nzb_behavior: DuplicateNzbBehavior::default(),
            defer_delay: default_defer_delay(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Behavior when a job's mount folder already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateNzbBehavior {
    /// Fail the new job immediately
    MarkFailed,
    /// Append " (2)", " (3)", ... up to 99 (default)
    #[default]
    Increment,
    /// Replace the existing mount folder
    Overwrite,
}

/// Article-existence health check configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Run the full-health sweep at ingest time (default: false)
    #[serde(default)]
    pub ensure_article_existence: bool,

    /// Fraction of a job's articles to sample, 0.0 < rate <= 1.0
    /// (default: 0.05)
    #[serde(default = "default_sampling_rate")]
    pub health_check_sampling_rate: f64,

    /// Lower bound on the sample size regardless of rate (default: 20)
    #[serde(default = "default_min_samples")]
    pub min_health_check_segments: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            ensure_article_existence: false,
            health_check_sampling_rate: default_sampling_rate(),
            min_health_check_segments: default_min_samples(),
        }
    }
}

/// Aggregation/import behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    /// How completed jobs are surfaced to media managers
    #[serde(default)]
    pub import_strategy: ImportStrategy,

    /// Fail the job when no importable video file is present (default: false)
    #[serde(default)]
    pub ensure_importable_video: bool,

    /// File extensions dropped at aggregation time
    #[serde(default = "default_blacklisted_extensions")]
    pub blacklisted_extensions: Vec<String>,

    /// Base URL prepended to `.strm` stream links
    #[serde(default)]
    pub strm_base_url: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            import_strategy: ImportStrategy::default(),
            ensure_importable_video: false,
            blacklisted_extensions: default_blacklisted_extensions(),
            strm_base_url: None,
        }
    }
}

/// How completed jobs are surfaced to media managers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStrategy {
    /// Emit `.strm` files with download-key-authenticated URLs
    Strm,
    /// Mirror video files as symlink items under the symlinks root (default)
    #[default]
    Symlinks,
}

/// Multi-server client tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Consecutive failures that open a server's circuit (default: 5)
    #[serde(default = "default_open_threshold")]
    pub circuit_open_threshold: u32,

    /// Cooldown before an open circuit admits a probe (default: 30 seconds)
    #[serde(default = "default_circuit_cooldown", with = "duration_secs")]
    pub circuit_cooldown: Duration,

    /// How long a confirmed-missing article stays cached
    /// (default: 10 minutes)
    #[serde(default = "default_missing_ttl", with = "duration_secs")]
    pub missing_cache_ttl: Duration,

    /// Bound on the missing-segment cache (default: 4096 entries)
    #[serde(default = "default_missing_capacity")]
    pub missing_cache_capacity: usize,

    /// Bound on the yEnc header cache (default: 8192 entries)
    #[serde(default = "default_header_capacity")]
    pub header_cache_capacity: usize,

    /// TCP connect + TLS handshake timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Per-command response timeout (default: 30 seconds)
    #[serde(default = "default_read_timeout", with = "duration_secs")]
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            circuit_open_threshold: default_open_threshold(),
            circuit_cooldown: default_circuit_cooldown(),
            missing_cache_ttl: default_missing_ttl(),
            missing_cache_capacity: default_missing_capacity(),
            header_cache_capacity: default_header_capacity(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

/// Data storage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "./usenet-fs.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Cap on history listings when the caller does not override it
    /// (default: 60, the SAB-compatible window)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Ignore the history limit and return everything the range asks for
    #[serde(default)]
    pub ignore_sab_history_limit: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            history_limit: default_history_limit(),
            ignore_sab_history_limit: false,
        }
    }
}

/// Download-key secrets
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key mixed into stream-URL signatures
    #[serde(default)]
    pub api_key: String,

    /// Separate key for paths under the ids root
    #[serde(default)]
    pub strm_key: String,
}

/// Main configuration for [`UsenetFs`](crate::UsenetFs)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server configurations (at least one enabled server required)
    pub servers: Vec<ServerConfig>,

    /// Queue/pipeline behavior
    #[serde(default)]
    pub queue: QueueConfig,

    /// Article-existence health checks
    #[serde(default)]
    pub health: HealthCheckConfig,

    /// Aggregation/import behavior
    #[serde(default)]
    pub import: ImportConfig,

    /// Multi-server client tuning
    #[serde(default)]
    pub client: ClientConfig,

    /// Data storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Download-key secrets
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Validate the configuration before constructing the service
    pub fn validate(&self) -> Result<()> {
        if !self.servers.iter().any(|s| s.enabled) {
            return Err(Error::Config {
                message: "at least one enabled server is required".to_string(),
                key: Some("servers".to_string()),
            });
        }
        for server in &self.servers {
            if server.max_connections == 0 {
                return Err(Error::Config {
                    message: format!("server '{}' has max_connections = 0", server.id),
                    key: Some("servers.max_connections".to_string()),
                });
            }
        }
        let rate = self.health.health_check_sampling_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(Error::Config {
                message: format!("sampling rate {rate} outside (0, 1]"),
                key: Some("health.health_check_sampling_rate".to_string()),
            });
        }
        if self.queue.max_queue_connections == 0 {
            return Err(Error::Config {
                message: "max_queue_connections must be at least 1".to_string(),
                key: Some("queue.max_queue_connections".to_string()),
            });
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10
}

fn default_max_queue_connections() -> usize {
    2
}

fn default_defer_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_sampling_rate() -> f64 {
    0.05
}

fn default_min_samples() -> usize {
    20
}

fn default_blacklisted_extensions() -> Vec<String> {
    ["exe", "com", "bat", "cmd", "scr", "vbs", "lnk"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_open_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_missing_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_missing_capacity() -> usize {
    4096
}

fn default_header_capacity() -> usize {
    8192
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./usenet-fs.db")
}

fn default_history_limit() -> usize {
    60
}

/// Serialize `Duration` as integer seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
