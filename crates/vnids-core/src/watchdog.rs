//! Engine watchdog: supervises the engine subprocess lifecycle.
//!
//! ```text
//! STOPPED ──start──▶ STARTING ──settled──▶ RUNNING ──exit──▶ CRASHED ──delay──▶ STARTING
//!                                              │                 │
//!                                            stop           budget spent
//!                                              ▼                 ▼
//!                                          STOPPING ──▶ STOPPED  FAILED
//! ```
//!
//! [`Watchdog::run`] is the only writer of the lifecycle state. Everyone
//! else holds a [`WatchdogHandle`]: `status()` reads the latest snapshot,
//! and control requests travel over a channel to the run loop with a
//! oneshot reply.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vnids_config::AppConfig;

use crate::backoff::Backoff;
use crate::daemon::ShutdownSignal;
use crate::engine::{EngineError, EngineExit, EngineLauncher, EngineProcess, LaunchSpec};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
    Failed,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Crashed => "crashed",
            EngineState::Stopping => "stopping",
            EngineState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned to control requests.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("not allowed while the engine is {0}")]
    InvalidState(EngineState),

    #[error("engine is unavailable (state: {0})")]
    Unavailable(EngineState),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("watchdog is not running")]
    Closed,
}

/// Restart limits and timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_backoff: Backoff,
    pub startup_settle: Duration,
    pub grace_timeout: Duration,
}

impl WatchdogSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_restarts: config.watchdog.max_restarts,
            restart_window: config.watchdog.restart_window(),
            restart_backoff: Backoff::from(&config.watchdog),
            startup_settle: config.engine.startup_settle(),
            grace_timeout: config.engine.grace_timeout(),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Bounded restart budget over a rolling window.
///
/// The window opens at the first restart and closes `window` later, at
/// which point the count drops back to zero. The run loop arms a timer for
/// the close so the reported count never outlives its window.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    backoff: Backoff,
    restart_count: u32,
    window_start: Option<Instant>,
    total_restarts: u64,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration, backoff: Backoff) -> Self {
        Self {
            max_restarts,
            window,
            backoff,
            restart_count: 0,
            window_start: None,
            total_restarts: 0,
        }
    }

    /// Account for a crash at `now`. Returns the delay before the restart,
    /// or `None` when the budget for this window is spent.
    pub fn on_crash(&mut self, now: Instant) -> Option<Duration> {
        self.expire(now);
        if self.restart_count >= self.max_restarts {
            return None;
        }

        self.window_start.get_or_insert(now);
        self.restart_count += 1;
        self.total_restarts += 1;
        Some(self.backoff.delay(self.restart_count - 1))
    }

    /// When the open window closes, if there is one.
    pub fn window_end(&self) -> Option<Instant> {
        self.window_start.map(|start| start + self.window)
    }

    /// Close the window if it has elapsed by `now`. Returns whether it did.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.window_end() {
            Some(end) if now >= end => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Forget the current window. Used when an operator revives a failed engine.
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.window_start = None;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn total_restarts(&self) -> u64 {
        self.total_restarts
    }
}

/// Point-in-time view of the watchdog, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub state: EngineState,
    pub restart_count: u32,
    pub total_restarts: u64,
    pub uptime_seconds: u64,
    pub pid: Option<u32>,
    pub last_exit: Option<EngineExit>,
    pub rules_dir: PathBuf,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: EngineState,
    restart_count: u32,
    total_restarts: u64,
    started_at: Option<Instant>,
    pid: Option<u32>,
    last_exit: Option<EngineExit>,
    rules_dir: PathBuf,
}

/// Result of a `reload_rules` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub rules_path: PathBuf,
    /// `false` when no engine was running; the path applies at next start.
    pub applied: bool,
    /// The engine was relaunched to pick up a different rule directory.
    pub restarted: bool,
}

enum Command {
    Stop(oneshot::Sender<Result<(), WatchdogError>>),
    Restart(oneshot::Sender<Result<EngineState, WatchdogError>>),
    Reload {
        rules_dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<ReloadOutcome, WatchdogError>>,
    },
}

/// Cloneable handle used by the IPC server and the daemon.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Stop(_) => f.write_str("Stop"),
            Command::Restart(_) => f.write_str("Restart"),
            Command::Reload { rules_dir, .. } => write!(f, "Reload({rules_dir:?})"),
        }
    }
}

impl WatchdogHandle {
    pub fn status(&self) -> WatchdogStatus {
        let snap = self.snapshot.borrow();
        let uptime_seconds = match (snap.state, snap.started_at) {
            (EngineState::Starting | EngineState::Running, Some(at)) => at.elapsed().as_secs(),
            _ => 0,
        };
        WatchdogStatus {
            state: snap.state,
            restart_count: snap.restart_count,
            total_restarts: snap.total_restarts,
            uptime_seconds,
            pid: snap.pid,
            last_exit: snap.last_exit,
            rules_dir: snap.rules_dir.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.snapshot.borrow().state
    }

    /// Wait until the engine reaches `target`.
    pub async fn wait_for_state(&self, target: EngineState) -> Result<(), WatchdogError> {
        let mut rx = self.snapshot.clone();
        rx.wait_for(|s| s.state == target)
            .await
            .map(|_| ())
            .map_err(|_| WatchdogError::Closed)
    }

    /// Gracefully stop the engine. A no-op when it is already down.
    pub async fn request_stop(&self) -> Result<(), WatchdogError> {
        self.call(Command::Stop).await
    }

    /// Restart the engine. Valid from `running`, `crashed`, or `failed`; a
    /// failed engine gets a fresh restart budget.
    pub async fn request_restart(&self) -> Result<EngineState, WatchdogError> {
        self.call(Command::Restart).await
    }

    /// Ask the engine to reload its rules, optionally from a new directory.
    pub async fn reload_rules(
        &self,
        rules_dir: Option<PathBuf>,
    ) -> Result<ReloadOutcome, WatchdogError> {
        self.call(|reply| Command::Reload { rules_dir, reply }).await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, WatchdogError>>) -> Command,
    ) -> Result<T, WatchdogError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| WatchdogError::Closed)?;
        rx.await.map_err(|_| WatchdogError::Closed)?
    }
}

/// What woke the run loop.
enum Wake {
    Exited(Result<EngineExit, EngineError>),
    Timer,
    WindowClosed,
    Command(Option<Command>),
    Shutdown,
}

/// The supervising task. Owns the engine process exclusively.
pub struct Watchdog {
    launcher: Arc<dyn EngineLauncher>,
    spec: LaunchSpec,
    settings: WatchdogSettings,
    budget: RestartBudget,
    state: EngineState,
    process: Option<Box<dyn EngineProcess>>,
    deadline: Option<Instant>,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<Snapshot>,
}

impl Watchdog {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        spec: LaunchSpec,
        settings: WatchdogSettings,
    ) -> (Self, WatchdogHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (snap_tx, snap_rx) = watch::channel(Snapshot {
            state: EngineState::Stopped,
            restart_count: 0,
            total_restarts: 0,
            started_at: None,
            pid: None,
            last_exit: None,
            rules_dir: spec.rules_dir.clone(),
        });

        let watchdog = Self {
            launcher,
            budget: RestartBudget::new(
                settings.max_restarts,
                settings.restart_window,
                settings.restart_backoff,
            ),
            spec,
            settings,
            state: EngineState::Stopped,
            process: None,
            deadline: None,
            commands: cmd_rx,
            snapshot: snap_tx,
        };
        let handle = WatchdogHandle {
            commands: cmd_tx,
            snapshot: snap_rx,
        };
        (watchdog, handle)
    }

    /// Start the engine and supervise it until shutdown, then stop it.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        self.start_engine();

        loop {
            let window_end = self.window_end();
            let wake = tokio::select! {
                exit = wait_exit(&mut self.process) => Wake::Exited(exit),
                _ = sleep_until(self.deadline) => Wake::Timer,
                _ = sleep_until(window_end) => Wake::WindowClosed,
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = shutdown.recv() => Wake::Shutdown,
            };

            match wake {
                Wake::Exited(exit) => self.on_exit(exit),
                Wake::Timer => self.on_timer(),
                Wake::WindowClosed => self.on_window_closed(),
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Command(None) | Wake::Shutdown => break,
            }
        }

        self.stop_engine().await;
        info!("watchdog stopped");
    }

    fn publish(&self) {
        let pid = self.process.as_ref().and_then(|p| p.id());
        let state = self.state;
        let restart_count = self.budget.restart_count();
        let total_restarts = self.budget.total_restarts();
        let rules_dir = self.spec.rules_dir.clone();
        self.snapshot.send_modify(|snap| {
            if state == EngineState::Starting && snap.state != EngineState::Starting {
                snap.started_at = Some(Instant::now());
            }
            snap.state = state;
            snap.restart_count = restart_count;
            snap.total_restarts = total_restarts;
            snap.pid = pid;
            snap.rules_dir = rules_dir;
        });
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "engine state change");
        }
        self.state = state;
        self.publish();
    }

    fn start_engine(&mut self) {
        match self.launcher.spawn(&self.spec) {
            Ok(process) => {
                info!(pid = ?process.id(), "engine starting");
                self.process = Some(process);
                self.deadline = Some(Instant::now() + self.settings.startup_settle);
                self.set_state(EngineState::Starting);
            }
            Err(e) => {
                error!(error = %e, "engine spawn failed");
                self.set_state(EngineState::Starting);
                self.on_crash(None);
            }
        }
    }

    fn on_exit(&mut self, exit: Result<EngineExit, EngineError>) {
        self.process = None;
        let last = match exit {
            Ok(exit) => {
                warn!(state = %self.state, %exit, "engine exited unexpectedly");
                Some(exit)
            }
            Err(e) => {
                warn!(state = %self.state, error = %e, "lost track of engine process");
                None
            }
        };
        self.on_crash(last);
    }

    fn on_crash(&mut self, exit: Option<EngineExit>) {
        self.snapshot.send_modify(|snap| snap.last_exit = exit);

        match self.budget.on_crash(Instant::now()) {
            Some(delay) => {
                warn!(
                    restart_count = self.budget.restart_count(),
                    max_restarts = self.settings.max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "engine crashed, restart scheduled"
                );
                self.deadline = Some(Instant::now() + delay);
                self.set_state(EngineState::Crashed);
            }
            None => {
                error!(
                    max_restarts = self.settings.max_restarts,
                    window_secs = self.settings.restart_window.as_secs(),
                    "engine restart budget exhausted, giving up until an operator restarts it"
                );
                self.deadline = None;
                self.set_state(EngineState::Failed);
            }
        }
    }

    fn on_timer(&mut self) {
        self.deadline = None;
        match self.state {
            EngineState::Starting => {
                info!(pid = ?self.process.as_ref().and_then(|p| p.id()), "engine running");
                self.set_state(EngineState::Running);
            }
            EngineState::Crashed => self.start_engine(),
            _ => {}
        }
    }

    /// A failed engine keeps its count until an operator restarts it.
    fn window_end(&self) -> Option<Instant> {
        match self.state {
            EngineState::Failed => None,
            _ => self.budget.window_end(),
        }
    }

    fn on_window_closed(&mut self) {
        if self.budget.expire(Instant::now()) {
            debug!(
                window_secs = self.settings.restart_window.as_secs(),
                "restart window elapsed, restart count cleared"
            );
            self.publish();
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        debug!(?cmd, state = %self.state, "watchdog command");
        match cmd {
            Command::Stop(reply) => {
                self.stop_engine().await;
                let _ = reply.send(Ok(()));
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Command::Reload { rules_dir, reply } => {
                let result = self.reload(rules_dir).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn restart(&mut self) -> Result<EngineState, WatchdogError> {
        match self.state {
            EngineState::Running => {
                info!("engine restart requested");
                self.stop_engine().await;
            }
            EngineState::Crashed => info!("engine restart requested, skipping backoff"),
            EngineState::Failed => {
                info!("engine restart requested, resetting restart budget");
                self.budget.reset();
            }
            other => return Err(WatchdogError::InvalidState(other)),
        }
        self.deadline = None;
        self.start_engine();
        Ok(self.state)
    }

    async fn reload(&mut self, rules_dir: Option<PathBuf>) -> Result<ReloadOutcome, WatchdogError> {
        let target = rules_dir.unwrap_or_else(|| self.spec.rules_dir.clone());
        match self.state {
            EngineState::Running if target == self.spec.rules_dir => {
                let process = self.process.as_mut().ok_or(WatchdogError::Unavailable(self.state))?;
                process.reload()?;
                info!(rules_dir = %target.display(), "engine rule reload signalled");
                Ok(ReloadOutcome {
                    rules_path: target,
                    applied: true,
                    restarted: false,
                })
            }
            EngineState::Running => {
                // SIGUSR2 only re-reads the directory given at launch
                info!(
                    from = %self.spec.rules_dir.display(),
                    to = %target.display(),
                    "rule directory changed, restarting engine"
                );
                self.spec.rules_dir = target.clone();
                self.stop_engine().await;
                self.start_engine();
                Ok(ReloadOutcome {
                    rules_path: target,
                    applied: self.state == EngineState::Starting,
                    restarted: true,
                })
            }
            EngineState::Stopped | EngineState::Failed => {
                info!(rules_dir = %target.display(), state = %self.state, "rules stored for next engine start");
                self.spec.rules_dir = target.clone();
                self.publish();
                Ok(ReloadOutcome {
                    rules_path: target,
                    applied: false,
                    restarted: false,
                })
            }
            other => Err(WatchdogError::Unavailable(other)),
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn stop_engine(&mut self) {
        self.deadline = None;
        let Some(mut process) = self.process.take() else {
            if self.state == EngineState::Crashed {
                self.set_state(EngineState::Stopped);
            }
            return;
        };

        self.state = EngineState::Stopping;
        let pid = process.id();
        self.snapshot.send_modify(|snap| {
            snap.state = EngineState::Stopping;
            snap.pid = pid;
        });
        info!(?pid, grace_ms = self.settings.grace_timeout.as_millis() as u64, "stopping engine");

        if let Err(e) = process.terminate() {
            debug!(error = %e, "terminate failed");
        }
        let exit = match tokio::time::timeout(self.settings.grace_timeout, process.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(?pid, "engine ignored SIGTERM, killing");
                if let Err(e) = process.kill() {
                    warn!(error = %e, "kill failed");
                }
                process.wait().await
            }
        };

        match exit {
            Ok(exit) => {
                info!(%exit, "engine stopped");
                self.snapshot.send_modify(|snap| snap.last_exit = Some(exit));
            }
            Err(e) => warn!(error = %e, "engine wait failed during stop"),
        }
        self.set_state(EngineState::Stopped);
    }
}

async fn wait_exit(process: &mut Option<Box<dyn EngineProcess>>) -> Result<EngineExit, EngineError> {
    match process {
        Some(p) => p.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::engine::fake::{FakeLauncher, FakeSignal};
    use pretty_assertions::assert_eq;

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            max_restarts: 5,
            restart_window: Duration::from_secs(300),
            restart_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            startup_settle: Duration::from_secs(1),
            grace_timeout: Duration::from_secs(10),
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::from_config(&vnids_config::EngineConfig::default())
    }

    struct Harness {
        launcher: FakeLauncher,
        handle: WatchdogHandle,
        shutdown: broadcast::Sender<ShutdownSignal>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(settings: WatchdogSettings) -> Harness {
        let launcher = FakeLauncher::new();
        let (watchdog, handle) = Watchdog::new(Arc::new(launcher.clone()), spec(), settings);
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(watchdog.run(rx));
        Harness {
            launcher,
            handle,
            shutdown,
            task,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_budget_allows_max_restarts_per_window() {
        let now = Instant::now();
        let mut budget = RestartBudget::new(5, Duration::from_secs(300), Backoff::default());
        let delays: Vec<_> = (0..5).map(|_| budget.on_crash(now).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
        assert_eq!(budget.restart_count(), 5);
        assert_eq!(budget.on_crash(now + Duration::from_secs(299)), None);
        assert_eq!(budget.restart_count(), 5);
    }

    #[test]
    fn test_budget_window_rolls() {
        let now = Instant::now();
        let mut budget = RestartBudget::new(2, Duration::from_secs(300), Backoff::default());
        budget.on_crash(now).unwrap();
        budget.on_crash(now + Duration::from_secs(10)).unwrap();
        assert!(budget.on_crash(now + Duration::from_secs(20)).is_none());

        let later = now + Duration::from_secs(300);
        assert_eq!(budget.on_crash(later), Some(Duration::from_millis(100)));
        assert_eq!(budget.restart_count(), 1);
        assert_eq!(budget.total_restarts(), 3);
    }

    #[test]
    fn test_budget_expire_clears_count() {
        let now = Instant::now();
        let mut budget = RestartBudget::new(5, Duration::from_secs(300), Backoff::default());
        assert_eq!(budget.window_end(), None);
        budget.on_crash(now).unwrap();
        assert_eq!(budget.window_end(), Some(now + Duration::from_secs(300)));

        assert!(!budget.expire(now + Duration::from_secs(299)));
        assert_eq!(budget.restart_count(), 1);
        assert!(budget.expire(now + Duration::from_secs(300)));
        assert_eq!(budget.restart_count(), 0);
        assert_eq!(budget.window_end(), None);
        assert_eq!(budget.total_restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_running_after_settle_time() {
        let h = start(settings());
        settle().await;
        assert_eq!(h.handle.state(), EngineState::Starting);
        assert_eq!(h.launcher.spawn_count(), 1);

        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let status = h.handle.status();
        assert_eq!(status.pid, Some(h.launcher.latest().unwrap().pid()));
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restarts_with_backoff() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();

        h.launcher.latest().unwrap().crash();
        h.handle.wait_for_state(EngineState::Crashed).await.unwrap();
        let crashed_at = Instant::now();
        assert_eq!(h.handle.status().last_exit, Some(EngineExit::code(1)));

        h.handle.wait_for_state(EngineState::Starting).await.unwrap();
        assert!(crashed_at.elapsed() >= Duration::from_millis(100));
        assert!(crashed_at.elapsed() < Duration::from_secs(1));
        assert_eq!(h.launcher.spawn_count(), 2);
        assert_eq!(h.handle.status().restart_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_crash_in_window_fails() {
        let h = start(settings());
        settle().await;
        h.launcher.exit_on_spawn(Some(EngineExit::code(1)));
        h.launcher.latest().unwrap().crash();

        h.handle.wait_for_state(EngineState::Failed).await.unwrap();
        // the original spawn plus five restarts
        assert_eq!(h.launcher.spawn_count(), 6);
        let status = h.handle.status();
        assert_eq!(status.restart_count, 5);
        assert_eq!(status.total_restarts, 5);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.launcher.spawn_count(), 6);
        assert_eq!(h.handle.state(), EngineState::Failed);
        assert_eq!(h.handle.status().restart_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_revives_failed_engine() {
        let h = start(settings());
        settle().await;
        h.launcher.exit_on_spawn(Some(EngineExit::code(1)));
        h.launcher.latest().unwrap().crash();
        h.handle.wait_for_state(EngineState::Failed).await.unwrap();

        h.launcher.exit_on_spawn(None);
        let state = h.handle.request_restart().await.unwrap();
        assert_eq!(state, EngineState::Starting);
        assert_eq!(h.handle.status().restart_count, 0);
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rejected_when_stopped() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        h.handle.request_stop().await.unwrap();
        assert_eq!(h.handle.state(), EngineState::Stopped);

        let err = h.handle.request_restart().await.unwrap_err();
        assert!(matches!(err, WatchdogError::InvalidState(EngineState::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_from_running_is_not_a_crash() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let first = h.launcher.latest().unwrap();

        h.handle.request_restart().await.unwrap();
        assert_eq!(first.signals(), vec![FakeSignal::Terminate]);
        assert_eq!(h.launcher.spawn_count(), 2);
        assert_eq!(h.handle.status().restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill_after_grace() {
        let h = start(settings());
        h.launcher.ignore_terminate(true);
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let stubborn = h.launcher.latest().unwrap();

        let before = Instant::now();
        h.handle.request_stop().await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(10));
        assert_eq!(stubborn.signals(), vec![FakeSignal::Terminate, FakeSignal::Kill]);
        assert_eq!(h.handle.state(), EngineState::Stopped);
        assert_eq!(h.handle.status().last_exit, Some(EngineExit::signal(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_by_state() {
        let h = start(settings());
        settle().await;
        let err = h.handle.reload_rules(None).await.unwrap_err();
        assert!(matches!(err, WatchdogError::Unavailable(EngineState::Starting)));

        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let outcome = h.handle.reload_rules(None).await.unwrap();
        assert_eq!(
            outcome,
            ReloadOutcome {
                rules_path: PathBuf::from("/etc/vnids/rules"),
                applied: true,
                restarted: false,
            }
        );
        assert_eq!(h.launcher.latest().unwrap().signals(), vec![FakeSignal::Reload]);
        assert_eq!(h.launcher.spawn_count(), 1);

        h.handle.request_stop().await.unwrap();
        let outcome = h
            .handle
            .reload_rules(Some(PathBuf::from("/srv/rules-v2")))
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(h.handle.status().rules_dir, PathBuf::from("/srv/rules-v2"));
        assert_eq!(
            h.launcher.last_spec().unwrap().rules_dir,
            PathBuf::from("/etc/vnids/rules")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_new_dir_relaunches_engine() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let first = h.launcher.latest().unwrap();

        let outcome = h
            .handle
            .reload_rules(Some(PathBuf::from("/srv/rules")))
            .await
            .unwrap();
        assert!(outcome.applied);
        assert!(outcome.restarted);

        // the old process is stopped, not signalled to reload
        assert_eq!(first.signals(), vec![FakeSignal::Terminate]);
        let second = h.launcher.latest().unwrap();
        assert_ne!(second.pid(), first.pid());
        assert_eq!(second.rules_dir(), Path::new("/srv/rules"));
        assert_eq!(h.handle.status().rules_dir, PathBuf::from("/srv/rules"));
        assert_eq!(h.handle.status().restart_count, 0);

        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let again = h
            .handle
            .reload_rules(Some(PathBuf::from("/srv/rules")))
            .await
            .unwrap();
        assert!(!again.restarted);
        assert_eq!(second.signals(), vec![FakeSignal::Reload]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_count_clears_when_window_elapses() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();

        h.launcher.latest().unwrap().crash();
        h.handle.wait_for_state(EngineState::Crashed).await.unwrap();
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        assert_eq!(h.handle.status().restart_count, 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        settle().await;
        let status = h.handle.status();
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.total_restarts, 1);
        assert_eq!(status.state, EngineState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_rejected_by_engine() {
        let h = start(settings());
        h.launcher.reject_reloads(Some("syntax error in local.rules"));
        h.handle.wait_for_state(EngineState::Running).await.unwrap();

        let err = h.handle.reload_rules(None).await.unwrap_err();
        assert!(matches!(
            err,
            WatchdogError::Engine(EngineError::ReloadRejected(_))
        ));
        assert_eq!(h.handle.state(), EngineState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_counts_as_crash() {
        let launcher = FakeLauncher::new();
        launcher.fail_spawns(true);
        let (watchdog, handle) = Watchdog::new(Arc::new(launcher.clone()), spec(), settings());
        let (_shutdown, rx) = broadcast::channel(1);
        tokio::spawn(watchdog.run(rx));

        handle.wait_for_state(EngineState::Failed).await.unwrap();
        assert_eq!(launcher.spawn_count(), 0);
        assert_eq!(handle.status().total_restarts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_engine() {
        let h = start(settings());
        h.handle.wait_for_state(EngineState::Running).await.unwrap();
        let engine = h.launcher.latest().unwrap();

        h.shutdown.send(ShutdownSignal).unwrap();
        h.task.await.unwrap();
        assert!(engine.has_exited());
        assert_eq!(engine.signals(), vec![FakeSignal::Terminate]);
    }
}
