#![deny(unsafe_code)]

//! vnids core supervisor runtime.
//!
//! Wraps a packet-inspection engine process: supervises it with a bounded
//! restart policy, turns its EVE JSON stream into a queryable event queue,
//! and serves control and telemetry requests over a local socket.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, for trait methods consumed
/// through `dyn Trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capped exponential backoff for restarts and reconnects.
pub mod backoff;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Binary frame codec for the control protocol.
pub mod codec;
/// Daemon startup, task wiring, and shutdown.
pub mod daemon;
/// In-process fan-out of ingested events.
pub mod dispatch;
/// Engine process abstraction.
pub mod engine;
/// EVE record model and line parser.
pub mod event;
/// EVE stream reader feeding the event queue.
pub mod ingest;
/// Control socket server and client.
pub mod ipc;
/// Bounded FIFO of normalized events.
pub mod queue;
/// SQLite event history.
pub mod storage;
/// Engine lifecycle supervision.
pub mod watchdog;

pub use backoff::{Backoff, ReconnectPolicy};
pub use daemon::{Daemon, DaemonError, RunningDaemon, ShutdownSignal};
pub use dispatch::{EventDispatcher, EventFilter, Subscription};
pub use engine::{EngineLauncher, EngineProcess, LaunchSpec, SystemLauncher};
pub use event::{EventKind, EventRecord, Severity};
pub use ingest::EventIngest;
pub use ipc::{Endpoint, IpcClient};
pub use queue::EventQueue;
pub use storage::{EventStore, HistoryQuery};
pub use watchdog::{EngineState, Watchdog, WatchdogHandle};
