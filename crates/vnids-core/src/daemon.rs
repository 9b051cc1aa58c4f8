//! Core daemon process: startup, task wiring and shutdown.
//!
//! [`Daemon::start`] claims the PID file, opens the event history when one
//! is configured, binds the control socket, and spawns the tasks sharing
//! one shutdown broadcast: the engine watchdog, the EVE ingest reader, the
//! IPC server and, with history on, the writer that persists published
//! events. [`RunningDaemon::wait`] blocks until SIGINT, SIGTERM, or a
//! `shutdown` command, then tears everything down in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use vnids_config::AppConfig;

use crate::dispatch::{EventDispatcher, EventFilter, Subscription};
use crate::engine::{EngineLauncher, LaunchSpec, SystemLauncher};
use crate::event::EventRecord;
use crate::ingest::EventIngest;
use crate::ipc::{Endpoint, IpcState, server};
use crate::queue::EventQueue;
use crate::storage::{EventStore, StorageError};
use crate::watchdog::{Watchdog, WatchdogSettings};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to bind control socket {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("daemon already running with pid {pid} (pid file {path})")]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("event database {path}: {source}")]
    Storage { path: PathBuf, source: StorageError },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The vnids supervisor daemon.
pub struct Daemon {
    config: Arc<AppConfig>,
    launcher: Arc<dyn EngineLauncher>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Daemon {
    /// A daemon that runs the configured engine binary.
    pub fn new(config: AppConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: AppConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config: Arc::new(config),
            launcher,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// A sender that triggers shutdown when signalled.
    pub fn shutdown_sender(&self) -> broadcast::Sender<ShutdownSignal> {
        self.shutdown_tx.clone()
    }

    /// Start, then run until shut down.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.start().await?.wait().await
    }

    /// Bring the daemon up. A failure here is the only fatal error: once
    /// this returns, every later fault is handled inside the daemon.
    pub async fn start(&self) -> Result<RunningDaemon, DaemonError> {
        let config = &self.config;
        info!(
            version = %crate::build_info::version_string(),
            socket = %config.ipc.socket_path,
            engine = %config.engine.binary,
            "vnids daemon starting"
        );

        let pid_file = match &config.daemon.pid_file {
            Some(path) => Some(PidFile::claim(Path::new(path))?),
            None => None,
        };

        let store = match &config.storage.database {
            Some(path) => match EventStore::open(Path::new(path), &config.storage) {
                Ok(store) => Some(Arc::new(store)),
                Err(source) => {
                    if let Some(pid_file) = pid_file {
                        pid_file.remove();
                    }
                    return Err(DaemonError::Storage {
                        path: PathBuf::from(path),
                        source,
                    });
                }
            },
            None => None,
        };

        let endpoint = Endpoint::parse(&config.ipc.socket_path);
        let listener = match endpoint.bind(config.ipc.socket_mode) {
            Ok(listener) => listener,
            Err(source) => {
                if let Some(pid_file) = pid_file {
                    pid_file.remove();
                }
                return Err(DaemonError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
        };

        // every task subscribes before anything can send
        let queue = EventQueue::from_config(&config.events);
        let dispatcher = EventDispatcher::default();
        let history = store
            .as_ref()
            .map(|store| (Arc::clone(store), dispatcher.subscribe(EventFilter::all())));
        let ingest = EventIngest::new(queue.clone()).with_dispatcher(dispatcher.clone());
        let (watchdog, watchdog_handle) = Watchdog::new(
            Arc::clone(&self.launcher),
            LaunchSpec::from_config(&config.engine),
            WatchdogSettings::from_config(config),
        );
        let state = Arc::new(IpcState {
            config: Arc::clone(config),
            queue: queue.clone(),
            watchdog: watchdog_handle,
            ingest: ingest.stats(),
            dispatcher,
            store,
            shutdown_tx: self.shutdown_tx.clone(),
            started_at: Instant::now(),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(watchdog.run(self.shutdown_tx.subscribe()));
        if let Some((store, events)) = history {
            tasks.spawn(persist_events(
                store,
                events,
                config.storage.write_batch,
                self.shutdown_tx.subscribe(),
            ));
        }
        tasks.spawn(serve_ingest(ingest, Arc::clone(config), self.shutdown_tx.subscribe()));
        tasks.spawn(server::serve(
            listener,
            endpoint.clone(),
            Arc::clone(&state),
            self.shutdown_tx.subscribe(),
        ));

        Ok(RunningDaemon {
            state,
            tasks,
            endpoint,
            pid_file,
            shutdown_rx: self.shutdown_tx.subscribe(),
        })
    }
}

async fn serve_ingest(
    ingest: EventIngest,
    config: Arc<AppConfig>,
    shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let poll = config.engine.poll_interval();
    match &config.engine.eve_socket {
        Some(socket) => ingest.follow_socket(Path::new(socket), poll, shutdown).await,
        None => {
            ingest
                .tail_file(Path::new(&config.engine.eve_log), poll, shutdown)
                .await
        }
    }
}

/// Copy published events into the history database until shutdown.
async fn persist_events(
    store: Arc<EventStore>,
    mut events: Subscription,
    batch_size: usize,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            record = events.recv() => match record {
                Some(record) => batch.push(record),
                None => break,
            },
        }
        events.drain_ready(batch_size.saturating_sub(batch.len()), &mut batch);
        write_batch(&store, &mut batch).await;
    }

    // flush what ingest published before it stopped
    loop {
        events.drain_ready(batch_size, &mut batch);
        if batch.is_empty() {
            break;
        }
        write_batch(&store, &mut batch).await;
    }
    debug!("event persistence stopped");
}

async fn write_batch(store: &Arc<EventStore>, batch: &mut Vec<Arc<EventRecord>>) {
    if batch.is_empty() {
        return;
    }
    let records = std::mem::take(batch);
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.insert_batch(&records)).await {
        Ok(Ok(written)) => trace!(written, "events stored"),
        Ok(Err(e)) => warn!(error = %e, "failed to store events"),
        Err(e) => error!(error = %e, "event store task failed"),
    }
}

/// A started daemon.
pub struct RunningDaemon {
    state: Arc<IpcState>,
    tasks: JoinSet<()>,
    endpoint: Endpoint,
    pid_file: Option<PidFile>,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl RunningDaemon {
    /// Shared state as seen by the IPC server.
    pub fn state(&self) -> &Arc<IpcState> {
        &self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for SIGINT, SIGTERM, or a shutdown request, then stop.
    pub async fn wait(mut self) -> Result<(), DaemonError> {
        let mut sigterm = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            _ = self.shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.state.shutdown_tx.send(ShutdownSignal);
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received, initiating graceful shutdown");
                let _ = self.state.shutdown_tx.send(ShutdownSignal);
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(mut self) {
        let _ = self.state.shutdown_tx.send(ShutdownSignal);

        // the watchdog may spend the full grace period stopping the engine
        let deadline = self.state.config.engine.grace_timeout() + Duration::from_secs(5);
        let drained = tokio::time::timeout(deadline, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "daemon task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("daemon tasks did not finish in time, aborting them");
            self.tasks.abort_all();
        }

        self.state.queue.clear();
        self.endpoint.cleanup();
        if let Some(pid_file) = self.pid_file.take() {
            pid_file.remove();
        }
        info!("Daemon stopped");
    }
}

/// PID file held for the life of the daemon.
#[derive(Debug)]
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn claim(path: &Path) -> Result<Self, DaemonError> {
        let pid_error = |source| DaemonError::PidFile {
            path: path.to_path_buf(),
            source,
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                if let Ok(pid) = contents.trim().parse::<i32>()
                    && pid > 0
                    && signal::kill(Pid::from_raw(pid), None).is_ok()
                {
                    return Err(DaemonError::AlreadyRunning {
                        pid,
                        path: path.to_path_buf(),
                    });
                }
                debug!(path = %path.display(), "replacing stale pid file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(pid_error(e)),
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(pid_error)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(pid_error)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}
