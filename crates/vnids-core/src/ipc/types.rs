//! JSON payloads carried inside IPC frames.
//!
//! Both the server (daemon) and the client (CLI) use these types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineExit;
use crate::event::{EngineStats, EventRecord};
use crate::watchdog::EngineState;

/// A request envelope as read off the wire.
///
/// `command` stays a string here so an unknown name can still be answered
/// with its `request_id`; [`Command::from_request`] does the real parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(command: &str, request_id: impl Into<Value>) -> Self {
        Self {
            command: command.to_string(),
            request_id: request_id.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// The closed set of daemon commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    ReloadRules(ReloadRulesParams),
    GetStats,
    GetEvents(GetEventsParams),
    GetHistory(GetHistoryParams),
    RestartEngine,
    Shutdown,
}

impl Command {
    pub const NAMES: [&'static str; 7] = [
        "status",
        "reload_rules",
        "get_stats",
        "get_events",
        "get_history",
        "restart_engine",
        "shutdown",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::ReloadRules(_) => "reload_rules",
            Command::GetStats => "get_stats",
            Command::GetEvents(_) => "get_events",
            Command::GetHistory(_) => "get_history",
            Command::RestartEngine => "restart_engine",
            Command::Shutdown => "shutdown",
        }
    }

    pub fn from_request(request: &Request) -> Result<Self, CommandError> {
        match request.command.as_str() {
            "status" => Ok(Command::Status),
            "reload_rules" => Ok(Command::ReloadRules(params(request)?)),
            "get_stats" => Ok(Command::GetStats),
            "get_events" => Ok(Command::GetEvents(params(request)?)),
            "get_history" => Ok(Command::GetHistory(params(request)?)),
            "restart_engine" => Ok(Command::RestartEngine),
            "shutdown" => Ok(Command::Shutdown),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl Command {
    /// Whether sending the command twice has the same effect as once.
    /// `get_events` in drain mode consumes what it returns, but a lost
    /// reply has consumed it either way.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Status | Command::GetStats | Command::GetEvents(_) | Command::GetHistory(_)
        )
    }
}

fn params<T: DeserializeOwned + Default>(request: &Request) -> Result<T, CommandError> {
    match &request.params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| CommandError::BadParams(format!("{}: {e}", request.command))),
    }
}

/// Why a request could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("invalid params for {0}")]
    BadParams(String),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::Unknown(_) => ErrorCode::UnknownCommand,
            CommandError::BadParams(_) => ErrorCode::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRulesParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,
}

/// `get_events` filters. Kept loose on the wire (`limit` may be negative,
/// `since` may be a string or a number); the server normalizes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetEventsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_max: Option<i64>,
}

/// `get_history` filters, read from the event database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetHistoryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

/// Wire-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    UnknownCommand,
    EngineUnavailable,
    EngineRejected,
    InvalidState,
    StorageDisabled,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::UnknownCommand => "UnknownCommand",
            ErrorCode::EngineUnavailable => "EngineUnavailable",
            ErrorCode::EngineRejected => "EngineRejected",
            ErrorCode::InvalidState => "InvalidState",
            ErrorCode::StorageDisabled => "StorageDisabled",
            ErrorCode::Internal => "Internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// A response envelope. Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(request_id: Value, data: &impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status: ResponseStatus::Ok,
                request_id,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::error(
                request_id,
                ErrorCode::Internal,
                format!("failed to encode response: {e}"),
            ),
        }
    }

    pub fn error(request_id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            request_id,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Decode `data` as `T`, or return the error body.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ResponseError> {
        match (self.status, self.data, self.error) {
            (ResponseStatus::Ok, data, _) => {
                serde_json::from_value(data.unwrap_or(Value::Null)).map_err(ResponseError::Decode)
            }
            (ResponseStatus::Error, _, Some(body)) => Err(ResponseError::Daemon(body)),
            (ResponseStatus::Error, _, None) => Err(ResponseError::Daemon(ErrorBody {
                code: ErrorCode::Internal,
                message: "error response without error body".to_string(),
            })),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("{}: {}", .0.code, .0.message)]
    Daemon(ErrorBody),

    #[error("unexpected response data: {0}")]
    Decode(serde_json::Error),
}

// ── Command data ────────────────────────────────────────────────────────

/// Engine part of `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub restart_count: u32,
    pub total_restarts: u64,
    pub uptime_seconds: u64,
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<EngineExit>,
    pub rules_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub daemon_running: bool,
    pub version: String,
    pub pid: u32,
    pub engine: EngineStatus,
    pub queue_len: usize,
    pub dropped_events: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsData {
    pub events_processed: u64,
    pub lines_read: u64,
    pub parse_errors: u64,
    pub alerts_total: u64,
    pub flows_total: u64,
    pub anomalies_total: u64,
    pub events_dropped: u64,
    pub source_reconnects: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub uptime_seconds: u64,
    pub state: EngineState,
    pub restart_count: u32,
    pub total_restarts: u64,
    pub engine: Option<EngineStats>,
    /// Records lost by in-process subscribers that fell behind.
    #[serde(default)]
    pub dispatch_lagged: u64,
    /// Present when event history is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub stored: u64,
    pub inserted: u64,
    pub pruned: u64,
    pub write_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsData {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadData {
    pub rules_path: String,
    pub applied: bool,
    /// Set when the engine was relaunched to switch rule directories.
    #[serde(default)]
    pub restarted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartData {
    pub state: EngineState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownData {
    pub acknowledged: bool,
}

/// Payload of a HEARTBEAT reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub uptime_seconds: u64,
}
