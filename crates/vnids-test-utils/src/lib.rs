#![deny(unsafe_code)]

//! Test harness for the vnids daemon.
//!
//! [`daemon::TestDaemon`] runs the whole supervisor in-process on a temp
//! directory, with the fake engine standing in for the IDS binary, so a
//! test can crash the engine, append EVE lines and talk to the control
//! socket. [`config::TestConfigBuilder`] shortens timings for that setup
//! and [`fixtures`] produces EVE lines in the engine's output format.

pub mod config;
pub mod daemon;
pub mod fixtures;
