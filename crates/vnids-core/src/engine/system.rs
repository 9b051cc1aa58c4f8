//! Real engine subprocess via `tokio::process`.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{EngineError, EngineExit, EngineLauncher, EngineProcess, LaunchSpec};
use crate::BoxFuture;

/// Spawns the configured engine binary.
#[derive(Debug, Default)]
pub struct SystemLauncher;

impl EngineLauncher for SystemLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineProcess>, EngineError> {
        let args = spec.args();
        debug!(binary = %spec.binary.display(), ?args, "spawning engine");

        let child = Command::new(&spec.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                binary: spec.binary.display().to_string(),
                source,
            })?;

        info!(pid = ?child.id(), binary = %spec.binary.display(), "engine spawned");
        Ok(Box::new(SystemProcess {
            pid: child.id(),
            child,
        }))
    }
}

/// A spawned engine process.
#[derive(Debug)]
pub struct SystemProcess {
    child: Child,
    pid: Option<u32>,
}

impl SystemProcess {
    fn send(&self, sig: Signal) -> Result<(), EngineError> {
        let pid = self.pid.ok_or(EngineError::NotRunning)?;
        let raw = i32::try_from(pid).map_err(|_| EngineError::NotRunning)?;
        signal::kill(Pid::from_raw(raw), sig).map_err(|source| EngineError::Signal { pid, source })
    }
}

impl EngineProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<EngineExit, EngineError>> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            self.pid = None;
            Ok(EngineExit {
                code: status.code(),
                signal: status.signal(),
            })
        })
    }

    fn terminate(&mut self) -> Result<(), EngineError> {
        self.send(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), EngineError> {
        self.child.start_kill()?;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), EngineError> {
        debug!(pid = ?self.pid, "sending SIGUSR2 for rule reload");
        self.send(Signal::SIGUSR2)
    }
}
