//! Daemon IPC: framed JSON over a Unix domain socket.
//!
//! The daemon listens on a local socket; the CLI connects as a client to
//! query status and statistics, read events, and control the engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐      Unix socket         ┌──────────────┐
//! │   CLI    │─────────────────────────▶│  IPC Server  │
//! │          │  16-byte header + JSON   │              │
//! └──────────┘                          └──────┬───────┘
//!                                              │
//!                                 ┌────────────┼────────────┐
//!                          ┌──────▼─────┐            ┌──────▼─────┐
//!                          │  Watchdog  │            │ EventQueue │
//!                          └────────────┘            └────────────┘
//! ```

pub mod client;
pub mod endpoint;
pub mod server;
pub mod types;

pub use client::{IpcClient, IpcClientError};
pub use endpoint::Endpoint;
pub use server::IpcState;
pub use types::*;
