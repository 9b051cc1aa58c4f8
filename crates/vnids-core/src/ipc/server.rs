//! IPC server: framed JSON requests over a Unix domain socket.
//!
//! Each accepted connection gets its own task. A connection carries any
//! number of request/response exchanges; a framing error closes that one
//! connection, while a bad JSON payload is answered with `BadRequest` and
//! the connection stays open.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use vnids_config::{AppConfig, EventsConfig};

use super::endpoint::Endpoint;
use super::types::*;
use crate::codec::{self, MessageType, ProtocolError};
use crate::daemon::ShutdownSignal;
use crate::dispatch::EventDispatcher;
use crate::engine::EngineError;
use crate::event::{EventKind, EventRecord, ParseError, Severity, parse_timestamp};
use crate::ingest::IngestStats;
use crate::queue::EventQueue;
use crate::storage::{EventStore, HistoryQuery};
use crate::watchdog::{WatchdogError, WatchdogHandle};

/// Shared state accessible to every connection.
pub struct IpcState {
    pub config: Arc<AppConfig>,
    pub queue: EventQueue,
    pub watchdog: WatchdogHandle,
    pub ingest: Arc<IngestStats>,
    pub dispatcher: EventDispatcher,
    /// Event history; `None` when no database is configured.
    pub store: Option<Arc<EventStore>>,
    pub shutdown_tx: broadcast::Sender<ShutdownSignal>,
    pub started_at: Instant,
}

impl IpcState {
    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Accept connections on `listener` until shutdown, then remove the
/// socket file.
pub async fn serve(
    listener: UnixListener,
    endpoint: Endpoint,
    state: Arc<IpcState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) {
    info!(endpoint = %endpoint, "IPC server listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("IPC server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = Arc::clone(&state);
                    let shutdown = state.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        handle_connection(stream, state, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    drop(listener);
    endpoint.cleanup();
}

async fn handle_connection(
    mut stream: UnixStream,
    state: Arc<IpcState>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let timeout = state.config.ipc.timeout();
    let max_frame = state.config.ipc.max_frame_bytes;
    let max_response = state.config.ipc.max_response_bytes as usize;
    debug!("IPC client connected");

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            frame = tokio::time::timeout(timeout, codec::read_frame(&mut stream, max_frame)) => frame,
        };

        let (header, payload) = match frame {
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "closing idle IPC connection");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(ProtocolError::Io(e))) => {
                debug!(error = %e, "IPC read failed");
                break;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "protocol error, closing connection");
                let response = Response::error(Value::Null, ErrorCode::BadRequest, e.to_string());
                let _ = send(&mut stream, MessageType::Response, &response, timeout).await;
                break;
            }
        };

        let (msg_type, reply) = match header.msg_type {
            MessageType::Request => (
                MessageType::Response,
                encode_response(&handle_request(&state, &payload).await, max_response),
            ),
            MessageType::Heartbeat => (
                MessageType::Heartbeat,
                encode_json(&HeartbeatData {
                    uptime_seconds: state.uptime_seconds(),
                }),
            ),
            other => (
                MessageType::Response,
                encode_json(&Response::error(
                    Value::Null,
                    ErrorCode::BadRequest,
                    format!("clients may not send {other:?} frames"),
                )),
            ),
        };

        if let Err(e) = write_reply(&mut stream, msg_type, &reply, timeout).await {
            debug!(error = %e, "IPC write failed");
            break;
        }
    }
    debug!("IPC client disconnected");
}

fn encode_json(value: &impl serde::Serialize) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        let fallback = Response::error(Value::Null, ErrorCode::Internal, e.to_string());
        serde_json::to_vec(&fallback).unwrap_or_default()
    })
}

/// Encode `response`, swapping it for an error when it would exceed `limit`.
fn encode_response(response: &Response, limit: usize) -> Vec<u8> {
    let encoded = encode_json(response);
    if encoded.len() <= limit {
        return encoded;
    }
    warn!(bytes = encoded.len(), limit, "response too large, replying with an error");
    encode_json(&Response::error(
        response.request_id.clone(),
        ErrorCode::Internal,
        format!(
            "response of {} bytes exceeds the {limit} byte limit; ask for fewer events",
            encoded.len()
        ),
    ))
}

async fn send(
    stream: &mut UnixStream,
    msg_type: MessageType,
    value: &impl serde::Serialize,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    write_reply(stream, msg_type, &encode_json(value), timeout).await
}

async fn write_reply(
    stream: &mut UnixStream,
    msg_type: MessageType,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    tokio::time::timeout(timeout, codec::write_frame(stream, msg_type, payload))
        .await
        .map_err(|_| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "response write timed out",
            ))
        })?
}

/// Decode one request payload and run it.
pub async fn handle_request(state: &IpcState, payload: &[u8]) -> Response {
    let request: Request = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            // salvage the request id when the envelope is valid JSON
            let request_id = serde_json::from_slice::<Value>(payload)
                .ok()
                .and_then(|v| v.get("request_id").cloned())
                .unwrap_or(Value::Null);
            debug!(error = %e, "malformed request payload");
            return Response::error(request_id, ErrorCode::BadRequest, format!("malformed request: {e}"));
        }
    };

    let command = match Command::from_request(&request) {
        Ok(command) => command,
        Err(e) => {
            debug!(command = %request.command, error = %e, "rejected request");
            return Response::error(request.request_id, e.code(), e.to_string());
        }
    };

    debug!(command = command.name(), request_id = %request.request_id, "IPC request");
    match dispatch(state, command).await {
        Ok(data) => Response {
            status: ResponseStatus::Ok,
            request_id: request.request_id,
            data: Some(data),
            error: None,
        },
        Err((code, message)) => Response::error(request.request_id, code, message),
    }
}

type CommandResult = Result<Value, (ErrorCode, String)>;

async fn dispatch(state: &IpcState, command: Command) -> CommandResult {
    match command {
        Command::Status => to_value(&status(state)),
        Command::GetStats => to_value(&stats(state)),
        Command::GetEvents(params) => to_value(&get_events(state, &params)?),
        Command::GetHistory(params) => to_value(&get_history(state, params).await?),
        Command::ReloadRules(params) => to_value(&reload_rules(state, params).await?),
        Command::RestartEngine => {
            let engine_state = state.watchdog.request_restart().await.map_err(watchdog_error)?;
            to_value(&RestartData { state: engine_state })
        }
        Command::Shutdown => {
            info!("shutdown requested via IPC");
            let _ = state.shutdown_tx.send(ShutdownSignal);
            to_value(&ShutdownData { acknowledged: true })
        }
    }
}

fn to_value(data: &impl serde::Serialize) -> CommandResult {
    serde_json::to_value(data).map_err(|e| (ErrorCode::Internal, e.to_string()))
}

fn status(state: &IpcState) -> StatusData {
    let engine = state.watchdog.status();
    StatusData {
        daemon_running: true,
        version: crate::build_info::VERSION.to_string(),
        pid: std::process::id(),
        engine: EngineStatus {
            state: engine.state,
            restart_count: engine.restart_count,
            total_restarts: engine.total_restarts,
            uptime_seconds: engine.uptime_seconds,
            pid: engine.pid,
            last_exit: engine.last_exit,
            rules_dir: engine.rules_dir.display().to_string(),
        },
        queue_len: state.queue.len(),
        dropped_events: state.queue.dropped_count(),
        uptime_seconds: state.uptime_seconds(),
    }
}

fn stats(state: &IpcState) -> StatsData {
    let counters = state.ingest.counters();
    let engine = state.watchdog.status();
    StatsData {
        events_processed: counters.events_processed,
        lines_read: counters.lines_read,
        parse_errors: counters.parse_errors,
        alerts_total: counters.alerts_total,
        flows_total: counters.flows_total,
        anomalies_total: counters.anomalies_total,
        events_dropped: state.queue.dropped_count(),
        source_reconnects: counters.source_reconnects,
        queue_len: state.queue.len(),
        queue_capacity: state.queue.capacity(),
        uptime_seconds: state.uptime_seconds(),
        state: engine.state,
        restart_count: engine.restart_count,
        total_restarts: engine.total_restarts,
        engine: state.ingest.engine_stats(),
        dispatch_lagged: state.dispatcher.lagged(),
        history: state.store.as_ref().map(|store| {
            let counters = store.counters();
            HistoryStats {
                stored: store.count().unwrap_or_else(|e| {
                    warn!(error = %e, "cannot count stored events");
                    0
                }),
                inserted: counters.inserted,
                pruned: counters.pruned,
                write_errors: counters.write_errors,
            }
        }),
    }
}

/// Requested limit, defaulted and capped by the events config.
fn event_limit(config: &EventsConfig, limit: Option<i64>) -> usize {
    match limit {
        None => config.default_limit,
        Some(n) if n <= 0 => 0,
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    }
    .min(config.max_events)
}

fn since_param(since: Option<&Value>) -> Result<Option<DateTime<Utc>>, (ErrorCode, String)> {
    match since {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_since(value).map(Some).map_err(|e| (ErrorCode::BadRequest, e)),
    }
}

fn severity_param(max: Option<i64>) -> Result<Option<Severity>, (ErrorCode, String)> {
    max.map(Severity::new)
        .transpose()
        .map_err(|e| (ErrorCode::BadRequest, format!("severity_max: {e}")))
}

fn get_events(state: &IpcState, params: &GetEventsParams) -> Result<EventsData, (ErrorCode, String)> {
    let limit = event_limit(&state.config.events, params.limit);
    let since = since_param(params.since.as_ref())?;

    let mut window = state.queue.pop_window(limit, since);
    if let Some(max) = severity_param(params.severity_max)? {
        window = window.max_severity(max);
    }

    let events: Vec<EventRecord> = window.map(|record| (*record).clone()).collect();
    Ok(EventsData {
        count: events.len(),
        events,
    })
}

async fn get_history(state: &IpcState, params: GetHistoryParams) -> Result<EventsData, (ErrorCode, String)> {
    let Some(store) = state.store.as_ref() else {
        return Err((
            ErrorCode::StorageDisabled,
            "event history is off; set storage.database to enable it".to_string(),
        ));
    };
    let query = HistoryQuery {
        limit: event_limit(&state.config.events, params.limit),
        since: since_param(params.since.as_ref())?,
        severity_max: severity_param(params.severity_max)?,
        event_type: params.event_type.map(EventKind::from),
    };

    let store = Arc::clone(store);
    let events = tokio::task::spawn_blocking(move || store.recent(&query))
        .await
        .map_err(|e| (ErrorCode::Internal, format!("history query task failed: {e}")))?
        .map_err(|e| (ErrorCode::Internal, format!("history query failed: {e}")))?;
    Ok(EventsData {
        count: events.len(),
        events,
    })
}

/// `since` as RFC 3339, the EVE timestamp form, or integer Unix seconds.
fn parse_since(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => parse_timestamp(s).map_err(|e: ParseError| format!("since: {e}")),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| format!("since: {n} is not a valid Unix timestamp")),
        other => Err(format!("since: expected a timestamp, got {other}")),
    }
}

async fn reload_rules(state: &IpcState, params: ReloadRulesParams) -> Result<ReloadData, (ErrorCode, String)> {
    let rules_dir = match params.rules_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !is_dir(&path).await {
                return Err((
                    ErrorCode::BadRequest,
                    format!("rules directory {} does not exist", path.display()),
                ));
            }
            Some(path)
        }
        None => None,
    };

    let outcome = state.watchdog.reload_rules(rules_dir).await.map_err(watchdog_error)?;
    Ok(ReloadData {
        rules_path: outcome.rules_path.display().to_string(),
        applied: outcome.applied,
        restarted: outcome.restarted,
    })
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

fn watchdog_error(err: WatchdogError) -> (ErrorCode, String) {
    let code = match &err {
        WatchdogError::InvalidState(_) => ErrorCode::InvalidState,
        WatchdogError::Unavailable(_) => ErrorCode::EngineUnavailable,
        WatchdogError::Engine(EngineError::ReloadRejected(_)) => ErrorCode::EngineRejected,
        WatchdogError::Engine(EngineError::NotRunning | EngineError::Signal { .. }) => {
            ErrorCode::EngineUnavailable
        }
        WatchdogError::Engine(_) | WatchdogError::Closed => ErrorCode::Internal,
    };
    (code, err.to_string())
}
