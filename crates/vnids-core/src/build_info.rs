//! What was built, from where, for which host.
//!
//! Logged when the daemon starts.

use chrono::{DateTime, Utc};

use crate::codec::PROTOCOL_VERSION;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit id, suffixed `-dirty` for a modified tree, or `unknown`
/// outside a git checkout.
pub const GIT_REVISION: &str = env!("VNIDS_GIT_REVISION");

pub const PROFILE: &str = env!("VNIDS_PROFILE");

/// Target triple the binary was compiled for.
pub const TARGET: &str = env!("VNIDS_TARGET");

const BUILT_AT: &str = env!("VNIDS_BUILT_AT");

/// Build time, or `None` if the stamp is unusable.
pub fn built_at() -> Option<DateTime<Utc>> {
    BUILT_AT.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// `"0.1.0 (3f2a9c1d0e release x86_64-unknown-linux-gnu, ipc 1.0)"`
pub fn version_string() -> String {
    format!(
        "{VERSION} ({GIT_REVISION} {PROFILE} {TARGET}, ipc {}.{})",
        PROTOCOL_VERSION >> 8,
        PROTOCOL_VERSION & 0xff
    )
}
