//! Engine subprocess abstraction.
//!
//! The watchdog never touches an OS process directly. It asks an
//! [`EngineLauncher`] for an [`EngineProcess`] and drives it through
//! wait/terminate/kill/reload. [`SystemLauncher`] runs the real engine
//! binary; tests swap in the scriptable fake from [`fake`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use vnids_config::EngineConfig;

use crate::BoxFuture;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
mod system;

pub use system::{SystemLauncher, SystemProcess};

/// Errors from spawning or signalling the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn engine {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("failed to signal engine pid {pid}: {source}")]
    Signal { pid: u32, source: nix::errno::Errno },

    #[error("engine process is not running")]
    NotRunning,

    #[error("engine rejected rule reload: {0}")]
    ReloadRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when it was killed by one.
    pub signal: Option<i32>,
}

impl EngineExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl std::fmt::Display for EngineExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Everything needed to start one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub rules_dir: PathBuf,
    pub log_dir: PathBuf,
    pub interfaces: Vec<String>,
}

impl LaunchSpec {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            binary: PathBuf::from(&config.binary),
            config: PathBuf::from(&config.config),
            rules_dir: PathBuf::from(&config.rules_dir),
            log_dir: PathBuf::from(&config.log_dir),
            interfaces: config.interfaces.clone(),
        }
    }

    /// Engine argv, without the binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.config.display().to_string(),
            "-S".to_string(),
            self.rules_dir.display().to_string(),
            "-l".to_string(),
            self.log_dir.display().to_string(),
        ];
        for iface in &self.interfaces {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        args.push("--runmode".to_string());
        args.push("workers".to_string());
        args
    }
}

/// A running engine instance, owned exclusively by the watchdog.
pub trait EngineProcess: Send {
    /// OS process id, while known.
    fn id(&self) -> Option<u32>;

    /// Resolve when the process exits. Must be cancel-safe: the watchdog
    /// races it against timers and control requests.
    fn wait(&mut self) -> BoxFuture<'_, Result<EngineExit, EngineError>>;

    /// Ask the process to shut down (SIGTERM).
    fn terminate(&mut self) -> Result<(), EngineError>;

    /// Force the process down (SIGKILL).
    fn kill(&mut self) -> Result<(), EngineError>;

    /// Ask the process to re-read its launch rule directory (SIGUSR2).
    fn reload(&mut self) -> Result<(), EngineError>;
}

/// Starts engine instances.
pub trait EngineLauncher: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineProcess>, EngineError>;
}
