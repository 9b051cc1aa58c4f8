#![deny(unsafe_code)]

//! Configuration loading and validation for the vnids supervisor daemon.
//!
//! Loads TOML configuration files and validates them before the daemon
//! starts. Provides the [`AppConfig`] type as the central configuration
//! structure. The daemon reads it once at startup and never again.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest socket path the kernel accepts (`sun_path` minus the NUL).
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon process configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Control socket configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Event queue configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Inspection engine subprocess configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Engine restart policy.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Persistent event history.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the daemon process itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where to write the daemon PID. Nothing is written when unset.
    #[serde(default)]
    pub pid_file: Option<String>,
}

/// Control socket configuration.
///
/// A `socket_path` that starts with `@` names a Linux abstract-namespace
/// socket; anything else is a filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Per-request read/write timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Largest frame payload the daemon accepts.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,

    /// Largest response payload the daemon sends and the client reads.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u32,

    /// Permission bits applied to a filesystem socket after bind.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            timeout_ms: default_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            max_response_bytes: default_max_response_bytes(),
            socket_mode: default_socket_mode(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl IpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_socket_path() -> String {
    "/run/vnids/control.sock".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> u32 {
    1024 * 1024
}

fn default_max_response_bytes() -> u32 {
    16 * 1024 * 1024
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

/// What the event queue does with a record that arrives while it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming record; queued records are never evicted.
    #[default]
    DropNewest,
    /// Evict the oldest queued record to make room.
    DropOldest,
}

/// Event queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Hard cap on the records a single `get_events` returns.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Limit used when a `get_events` request omits one.
    #[serde(default = "default_event_limit")]
    pub default_limit: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// When set, `get_events` removes the records it returns.
    #[serde(default)]
    pub drain_on_read: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_events: default_max_events(),
            default_limit: default_event_limit(),
            overflow_policy: OverflowPolicy::default(),
            drain_on_read: false,
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_events() -> usize {
    1000
}

fn default_event_limit() -> usize {
    100
}

/// Inspection engine subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// Engine configuration file passed with `-c`.
    #[serde(default = "default_engine_config")]
    pub config: String,

    /// Rule directory passed with `-S`; replaced by `reload_rules`.
    #[serde(default = "default_rules_dir")]
    pub rules_dir: String,

    /// EVE JSON log the daemon tails.
    #[serde(default = "default_eve_log")]
    pub eve_log: String,

    /// Unix stream socket the engine writes EVE records to. When set it is
    /// read instead of `eve_log`.
    #[serde(default)]
    pub eve_socket: Option<String>,

    /// Engine log directory passed with `-l`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    /// How long a fresh process must stay alive to count as running.
    #[serde(default = "default_startup_settle_ms")]
    pub startup_settle_ms: u64,

    /// Time between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,

    /// EVE log poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            config: default_engine_config(),
            rules_dir: default_rules_dir(),
            eve_log: default_eve_log(),
            eve_socket: None,
            log_dir: default_log_dir(),
            interfaces: default_interfaces(),
            startup_settle_ms: default_startup_settle_ms(),
            grace_timeout_ms: default_grace_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_engine_binary() -> String {
    "/usr/bin/suricata".to_string()
}

fn default_engine_config() -> String {
    "/etc/vnids/suricata.yaml".to_string()
}

fn default_rules_dir() -> String {
    "/etc/vnids/rules".to_string()
}

fn default_eve_log() -> String {
    "/var/log/vnids/eve.json".to_string()
}

fn default_log_dir() -> String {
    "/var/log/vnids".to_string()
}

fn default_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

fn default_startup_settle_ms() -> u64 {
    1000
}

fn default_grace_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

/// Engine restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Restarts allowed inside one window before the engine is declared failed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Delay before the first restart in a window; doubled for each one after.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_max_restart_delay_ms")]
    pub max_restart_delay_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: default_max_restart_delay_ms(),
        }
    }
}

impl WatchdogConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window_secs() -> u64 {
    300
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_max_restart_delay_ms() -> u64 {
    60_000
}

/// Persistent event history in SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. History is disabled when unset.
    #[serde(default)]
    pub database: Option<String>,

    /// Rows kept before the oldest are pruned.
    #[serde(default = "default_storage_max_events")]
    pub max_events: u64,

    /// Extra rows removed by each prune, so pruning does not run on every write.
    #[serde(default = "default_prune_batch")]
    pub prune_batch: u64,

    /// Most events written in one transaction.
    #[serde(default = "default_write_batch")]
    pub write_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: None,
            max_events: default_storage_max_events(),
            prune_batch: default_prune_batch(),
            write_batch: default_write_batch(),
        }
    }
}

fn default_storage_max_events() -> u64 {
    100_000
}

fn default_prune_batch() -> u64 {
    1000
}

fn default_write_batch() -> usize {
    256
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `VNIDS_*` environment overrides. Callers re-validate afterwards.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup, keyed by environment variable name.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VNIDS_SOCKET_PATH") {
            debug!(socket_path = %v, "socket path overridden from environment");
            self.ipc.socket_path = v;
        }
        if let Some(v) = lookup("VNIDS_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("VNIDS_RULES_DIR") {
            self.engine.rules_dir = v;
        }
        if let Some(v) = lookup("VNIDS_EVE_LOG") {
            self.engine.eve_log = v;
        }
        if let Some(v) = lookup("VNIDS_DATABASE") {
            debug!(database = %v, "event database overridden from environment");
            self.storage.database = Some(v);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let socket = &self.ipc.socket_path;
        if socket.is_empty() || socket == "@" {
            return Err(ConfigError::Validation(
                "ipc.socket_path must not be empty".to_string(),
            ));
        }
        let name_len = socket.strip_prefix('@').unwrap_or(socket).len();
        if name_len > MAX_SOCKET_PATH_LEN {
            return Err(ConfigError::Validation(format!(
                "ipc.socket_path is {name_len} bytes, limit is {MAX_SOCKET_PATH_LEN}"
            )));
        }
        if self.ipc.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "ipc.timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.ipc.max_frame_bytes == 0 {
            return Err(ConfigError::Validation(
                "ipc.max_frame_bytes must be non-zero".to_string(),
            ));
        }
        if self.ipc.max_response_bytes < self.ipc.max_frame_bytes {
            return Err(ConfigError::Validation(format!(
                "ipc.max_response_bytes ({}) is below ipc.max_frame_bytes ({})",
                self.ipc.max_response_bytes, self.ipc.max_frame_bytes
            )));
        }
        if self.ipc.reconnect_initial_ms > self.ipc.reconnect_max_ms {
            return Err(ConfigError::Validation(format!(
                "ipc.reconnect_initial_ms ({}) exceeds ipc.reconnect_max_ms ({})",
                self.ipc.reconnect_initial_ms, self.ipc.reconnect_max_ms
            )));
        }

        if self.events.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "events.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.events.max_events == 0 {
            return Err(ConfigError::Validation(
                "events.max_events must be at least 1".to_string(),
            ));
        }
        if self.events.default_limit > self.events.max_events {
            return Err(ConfigError::Validation(format!(
                "events.default_limit ({}) exceeds events.max_events ({})",
                self.events.default_limit, self.events.max_events
            )));
        }

        if self.engine.binary.is_empty() {
            return Err(ConfigError::Validation(
                "engine.binary must not be empty".to_string(),
            ));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.poll_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.watchdog.max_restarts == 0 {
            return Err(ConfigError::Validation(
                "watchdog.max_restarts must be at least 1".to_string(),
            ));
        }
        if self.watchdog.restart_window_secs == 0 {
            return Err(ConfigError::Validation(
                "watchdog.restart_window_secs must be non-zero".to_string(),
            ));
        }
        if self.watchdog.restart_delay_ms > self.watchdog.max_restart_delay_ms {
            return Err(ConfigError::Validation(format!(
                "watchdog.restart_delay_ms ({}) exceeds watchdog.max_restart_delay_ms ({})",
                self.watchdog.restart_delay_ms, self.watchdog.max_restart_delay_ms
            )));
        }

        if self.storage.database.as_deref() == Some("") {
            return Err(ConfigError::Validation(
                "storage.database must not be empty when set".to_string(),
            ));
        }
        if self.storage.max_events == 0 {
            return Err(ConfigError::Validation(
                "storage.max_events must be at least 1".to_string(),
            ));
        }
        if self.storage.write_batch == 0 {
            return Err(ConfigError::Validation(
                "storage.write_batch must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.ipc.socket_path, "/run/vnids/control.sock");
        assert_eq!(config.ipc.timeout_ms, 5000);
        assert_eq!(config.events.queue_capacity, 1024);
        assert_eq!(config.events.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.watchdog.max_restarts, 5);
        assert_eq!(config.watchdog.restart_window_secs, 300);
        assert_eq!(config.logging.level, "info");
        assert!(config.daemon.pid_file.is_none());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.events.queue_capacity, 1024);
        assert_eq!(config.ipc.socket_mode, 0o660);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [ipc]
            socket_path = "/tmp/vnids-test.sock"
            timeout_ms = 5000
            socket_mode = 0o600

            [events]
            queue_capacity = 16
            max_events = 8
            default_limit = 4
            overflow_policy = "drop_oldest"
            drain_on_read = true

            [engine]
            binary = "/opt/suricata/bin/suricata"
            interfaces = ["ens3", "ens4"]
            grace_timeout_ms = 2500

            [watchdog]
            max_restarts = 3
            restart_window_secs = 60

            [logging]
            level = "debug"
        "#;

        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.ipc.socket_path, "/tmp/vnids-test.sock");
        assert_eq!(config.ipc.socket_mode, 0o600);
        assert_eq!(config.events.queue_capacity, 16);
        assert_eq!(config.events.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.events.drain_on_read);
        assert_eq!(config.engine.interfaces, vec!["ens3", "ens4"]);
        assert_eq!(config.engine.grace_timeout(), Duration::from_millis(2500));
        assert_eq!(config.watchdog.restart_window(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_long_socket_path() {
        let toml = format!("[ipc]\nsocket_path = \"/tmp/{}.sock\"\n", "x".repeat(120));
        let err = AppConfig::parse(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validation_accepts_abstract_socket() {
        let config = AppConfig::parse("[ipc]\nsocket_path = \"@vnids-control\"\n").unwrap();
        assert_eq!(config.ipc.socket_path, "@vnids-control");

        assert!(AppConfig::parse("[ipc]\nsocket_path = \"@\"\n").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        assert!(AppConfig::parse("[events]\nqueue_capacity = 0\n").is_err());
    }

    #[test]
    fn test_validation_rejects_default_limit_above_max() {
        let toml = r#"
            [events]
            max_events = 10
            default_limit = 50
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_restarts() {
        assert!(AppConfig::parse("[watchdog]\nmax_restarts = 0\n").is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_restart_delays() {
        let toml = r#"
            [watchdog]
            restart_delay_ms = 5000
            max_restart_delay_ms = 1000
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_storage_section() {
        assert!(AppConfig::default().storage.database.is_none());

        let toml = r#"
            [storage]
            database = "/var/lib/vnids/events.db"
            max_events = 5000
            prune_batch = 50
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.storage.database.as_deref(), Some("/var/lib/vnids/events.db"));
        assert_eq!(config.storage.max_events, 5000);
        assert_eq!(config.storage.prune_batch, 50);
        assert_eq!(config.storage.write_batch, 256);

        assert!(AppConfig::parse("[storage]\ndatabase = \"\"\n").is_err());
        assert!(AppConfig::parse("[storage]\nmax_events = 0\n").is_err());
    }

    #[test]
    fn test_response_limit_not_below_frame_limit() {
        let config = AppConfig::default();
        assert_eq!(config.ipc.max_response_bytes, 16 * 1024 * 1024);

        let toml = r#"
            [ipc]
            max_frame_bytes = 65536
            max_response_bytes = 4096
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("max_response_bytes"));
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let err = AppConfig::parse("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_unknown_overflow_policy_is_parse_error() {
        let err = AppConfig::parse("[events]\noverflow_policy = \"drop_random\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut config = AppConfig::default();
        config.apply_overrides_from(|key| match key {
            "VNIDS_SOCKET_PATH" => Some("/tmp/override.sock".to_string()),
            "VNIDS_LOG_LEVEL" => Some("trace".to_string()),
            "VNIDS_DATABASE" => Some("/tmp/events.db".to_string()),
            _ => None,
        });
        assert_eq!(config.storage.database.as_deref(), Some("/tmp/events.db"));

        assert_eq!(config.ipc.socket_path, "/tmp/override.sock");
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.engine.rules_dir, "/etc/vnids/rules");
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed = AppConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.ipc.socket_path, config.ipc.socket_path);
        assert_eq!(reparsed.engine.interfaces, config.engine.interfaces);
    }

    #[test_log::test(tokio::test)]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vnids.toml");
        std::fs::write(
            &path,
            "[ipc]\nsocket_path = \"/tmp/vnids-test.sock\"\n[events]\nqueue_capacity = 1024\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.ipc.socket_path, "/tmp/vnids-test.sock");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
