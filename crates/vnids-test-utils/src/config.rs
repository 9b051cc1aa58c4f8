//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use vnids_config::{AppConfig, OverflowPolicy};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .in_dir(tmp.path())
///     .queue_capacity(5)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Point every runtime path (socket, EVE log, pid file, rules, logs)
    /// into `dir`, and shorten the timings so tests run quickly.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        let path = |name: &str| dir.join(name).display().to_string();
        self.config.ipc.socket_path = path("control.sock");
        self.config.engine.eve_log = path("eve.json");
        self.config.engine.rules_dir = path("rules");
        self.config.engine.log_dir = dir.display().to_string();
        self.config.daemon.pid_file = Some(path("vnidsd.pid"));
        self.config.engine.poll_interval_ms = 20;
        self.config.engine.startup_settle_ms = 50;
        self.config.engine.grace_timeout_ms = 500;
        self.config.watchdog.restart_delay_ms = 10;
        self.config.watchdog.max_restart_delay_ms = 100;
        self.config.ipc.reconnect_initial_ms = 10;
        self.config.ipc.reconnect_max_ms = 200;
        self.config.ipc.reconnect_max_attempts = 20;
        self
    }

    pub fn eve_socket(mut self, path: &str) -> Self {
        self.config.engine.eve_socket = Some(path.to_string());
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.events.queue_capacity = capacity;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.events.overflow_policy = policy;
        self
    }

    pub fn drain_on_read(mut self, drain: bool) -> Self {
        self.config.events.drain_on_read = drain;
        self
    }

    pub fn max_events(mut self, max: usize) -> Self {
        self.config.events.max_events = max;
        self.config.events.default_limit = self.config.events.default_limit.min(max);
        self
    }

    pub fn max_restarts(mut self, n: u32) -> Self {
        self.config.watchdog.max_restarts = n;
        self
    }

    /// How long the server waits on a half-read request before closing.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.ipc.timeout_ms = ms;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
