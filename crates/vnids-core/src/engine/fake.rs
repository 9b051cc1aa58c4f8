//! Scriptable in-memory engine for tests.
//!
//! [`FakeLauncher`] hands out [`FakeProcess`]es and keeps a
//! [`FakeControl`] for each so a test can crash the process, inspect the
//! signals it received, or make it ignore SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use super::{EngineError, EngineExit, EngineLauncher, EngineProcess, LaunchSpec};
use crate::BoxFuture;

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// A signal delivered to a fake process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeSignal {
    Terminate,
    Kill,
    Reload,
}

#[derive(Debug, Default)]
struct Script {
    fail_spawn: bool,
    exit_on_spawn: Option<EngineExit>,
    ignore_terminate: bool,
    reject_reload: Option<String>,
    spawned: Vec<FakeControl>,
    specs: Vec<LaunchSpec>,
}

/// Launcher that records every spawn and follows a test-set script.
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    script: Arc<Mutex<Script>>,
    next_pid: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later spawn fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.script().fail_spawn = fail;
    }

    /// Make every later process exit as soon as it starts.
    pub fn exit_on_spawn(&self, exit: Option<EngineExit>) {
        self.script().exit_on_spawn = exit;
    }

    /// Make later processes survive SIGTERM, forcing the kill path.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.script().ignore_terminate = ignore;
    }

    /// Make later reloads fail with the given message.
    pub fn reject_reloads(&self, message: Option<&str>) {
        self.script().reject_reload = message.map(str::to_string);
    }

    pub fn spawn_count(&self) -> usize {
        self.script().spawned.len()
    }

    /// Control handle for the `n`th spawned process.
    pub fn process(&self, n: usize) -> Option<FakeControl> {
        self.script().spawned.get(n).cloned()
    }

    pub fn latest(&self) -> Option<FakeControl> {
        self.script().spawned.last().cloned()
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.script().specs.last().cloned()
    }
}

impl EngineLauncher for FakeLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineProcess>, EngineError> {
        let mut script = self.script();
        script.specs.push(spec.clone());
        if script.fail_spawn {
            return Err(EngineError::Spawn {
                binary: spec.binary.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(script.exit_on_spawn);
        let control = FakeControl {
            pid,
            rules_dir: spec.rules_dir.clone(),
            exit_tx: Arc::new(exit_tx),
            signals: Arc::new(Mutex::new(Vec::new())),
        };
        script.spawned.push(control.clone());

        Ok(Box::new(FakeProcess {
            control,
            exit_rx,
            ignore_terminate: script.ignore_terminate,
            reject_reload: script.reject_reload.clone(),
        }))
    }
}

/// Test-side handle to one fake process.
#[derive(Debug, Clone)]
pub struct FakeControl {
    pid: u32,
    rules_dir: PathBuf,
    exit_tx: Arc<watch::Sender<Option<EngineExit>>>,
    signals: Arc<Mutex<Vec<FakeSignal>>>,
}

impl FakeControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The rule directory this process was launched with.
    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// End the process with `exit`. Later calls are ignored.
    pub fn exit(&self, exit: EngineExit) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    /// Simulate an engine crash.
    pub fn crash(&self) {
        self.exit(EngineExit::code(1));
    }

    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }

    pub fn signals(&self) -> Vec<FakeSignal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, signal: FakeSignal) {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
    }
}

/// The process half handed to the watchdog.
#[derive(Debug)]
pub struct FakeProcess {
    control: FakeControl,
    exit_rx: watch::Receiver<Option<EngineExit>>,
    ignore_terminate: bool,
    reject_reload: Option<String>,
}

impl EngineProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        if self.control.has_exited() {
            None
        } else {
            Some(self.control.pid)
        }
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<EngineExit, EngineError>> {
        Box::pin(async move {
            let exit = self
                .exit_rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| EngineError::NotRunning)?;
            (*exit).ok_or(EngineError::NotRunning)
        })
    }

    fn terminate(&mut self) -> Result<(), EngineError> {
        if self.control.has_exited() {
            return Err(EngineError::NotRunning);
        }
        self.control.record(FakeSignal::Terminate);
        if !self.ignore_terminate {
            self.control.exit(EngineExit::signal(SIGTERM));
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<(), EngineError> {
        self.control.record(FakeSignal::Kill);
        self.control.exit(EngineExit::signal(SIGKILL));
        Ok(())
    }

    fn reload(&mut self) -> Result<(), EngineError> {
        if self.control.has_exited() {
            return Err(EngineError::NotRunning);
        }
        self.control.record(FakeSignal::Reload);
        match &self.reject_reload {
            Some(message) => Err(EngineError::ReloadRejected(message.clone())),
            None => Ok(()),
        }
    }
}
