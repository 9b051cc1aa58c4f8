//! Daemon test helpers.
//!
//! [`TestDaemon`] runs a real in-process daemon against a temp-dir socket,
//! with the scriptable fake engine in place of the engine binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use vnids_config::AppConfig;
use vnids_core::engine::fake::FakeLauncher;
use vnids_core::ipc::IpcClient;
use vnids_core::{Daemon, EngineState, RunningDaemon};

use crate::config::TestConfigBuilder;

/// A started test daemon with an owned temp directory.
///
/// The temp directory is deleted automatically when this value is dropped,
/// including after a panic.
pub struct TestDaemon {
    pub launcher: FakeLauncher,
    pub config: AppConfig,
    daemon: Daemon,
    running: Option<RunningDaemon>,
    temp_dir: TempDir,
}

impl TestDaemon {
    /// Start a daemon with test defaults.
    pub async fn start() -> Self {
        Self::start_with(|builder| builder).await
    }

    /// Start a daemon, customising the config first. Runtime paths already
    /// point into the temp directory when `customise` runs.
    pub async fn start_with(customise: impl FnOnce(TestConfigBuilder) -> TestConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = customise(TestConfigBuilder::new().in_dir(temp_dir.path())).build();
        config.validate().expect("invalid test config");
        std::fs::create_dir_all(&config.engine.rules_dir).expect("failed to create rules dir");

        let launcher = FakeLauncher::new();
        let daemon = Daemon::with_launcher(config.clone(), Arc::new(launcher.clone()));
        let running = daemon.start().await.expect("failed to start test daemon");

        Self {
            launcher,
            config,
            daemon,
            running: Some(running),
            temp_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.config.ipc.socket_path)
    }

    pub fn running(&self) -> &RunningDaemon {
        self.running.as_ref().expect("daemon already stopped")
    }

    /// A client configured for this daemon.
    pub fn client(&self) -> IpcClient {
        IpcClient::from_config(&self.config.ipc)
    }

    /// Append lines to the EVE log the daemon tails.
    pub async fn append_eve(&self, lines: &[String]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.engine.eve_log)
            .await
            .expect("failed to open EVE log");
        for line in lines {
            file.write_all(line.as_bytes()).await.expect("EVE write failed");
            file.write_all(b"\n").await.expect("EVE write failed");
        }
        file.flush().await.expect("EVE flush failed");
    }

    /// Wait until the ingest has read `lines` lines in total.
    pub async fn wait_for_lines(&self, lines: u64) {
        let ingest = Arc::clone(&self.running().state().ingest);
        wait_until(|| ingest.counters().lines_read >= lines).await;
    }

    pub async fn wait_for_engine(&self, state: EngineState) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.running().state().watchdog.wait_for_state(state),
        )
        .await
        .expect("timed out waiting for engine state")
        .expect("watchdog stopped");
    }

    /// Request shutdown and wait for the daemon to finish.
    pub async fn stop(mut self) {
        if let Some(running) = self.running.take() {
            self.daemon.shutdown();
            running.wait().await.expect("daemon shutdown failed");
        }
    }
}

/// Poll `cond` every 10 ms for up to 5 s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
