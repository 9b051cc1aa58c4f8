//! IPC client: talks to the daemon over its control socket.
//!
//! Connection attempts follow a [`ReconnectPolicy`]: failed attempts are
//! retried with capped exponential backoff until the attempt cap, after
//! which the client reports a permanent failure. An established
//! connection is reused across requests. When the daemon closed it in
//! between, read-only commands are resent once on a fresh connection;
//! commands that change daemon state are not, since the daemon may
//! already have acted on them.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use vnids_config::IpcConfig;

use super::endpoint::Endpoint;
use super::types::*;
use crate::backoff::ReconnectPolicy;
use crate::codec::{self, MessageType, ProtocolError};

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("could not connect to daemon at {endpoint} after {attempts} attempts: {source}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("daemon closed the connection")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected {0:?} frame from daemon")]
    UnexpectedFrame(MessageType),

    #[error("response does not match request id {expected}: got {actual}")]
    RequestIdMismatch { expected: Value, actual: Value },

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("daemon returned error: {0}")]
    Daemon(#[from] ResponseError),
}

/// Client for the daemon's control socket.
#[derive(Debug)]
pub struct IpcClient {
    endpoint: Endpoint,
    timeout: Duration,
    max_response: u32,
    reconnect: ReconnectPolicy,
    stream: Option<UnixStream>,
    next_id: u64,
}

impl IpcClient {
    pub fn new(endpoint: Endpoint) -> Self {
        let defaults = IpcConfig::default();
        Self {
            endpoint,
            timeout: defaults.timeout(),
            max_response: defaults.max_response_bytes,
            reconnect: ReconnectPolicy::default(),
            stream: None,
            next_id: 1,
        }
    }

    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            endpoint: Endpoint::parse(&config.socket_path),
            timeout: config.timeout(),
            max_response: config.max_response_bytes,
            reconnect: ReconnectPolicy::from(config),
            stream: None,
            next_id: 1,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Largest response frame accepted from the daemon.
    pub fn with_max_response(mut self, bytes: u32) -> Self {
        self.max_response = bytes;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect, retrying per the reconnect policy.
    pub async fn connect(&mut self) -> Result<(), IpcClientError> {
        let mut attempts = 0;
        loop {
            match self.endpoint.connect().await {
                Ok(stream) => {
                    debug!(endpoint = %self.endpoint, attempts = attempts + 1, "connected to daemon");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(source) => {
                    if self.reconnect.is_exhausted(attempts + 1) {
                        return Err(IpcClientError::RetriesExhausted {
                            endpoint: self.endpoint.to_string(),
                            attempts: attempts + 1,
                            source,
                        });
                    }
                    let delay = self.reconnect.backoff.delay(attempts);
                    debug!(
                        endpoint = %self.endpoint,
                        attempt = attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "daemon not reachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Send one frame and read the reply frame. `retry` allows one resend on
    /// a fresh connection when the cached one turns out to be dead.
    async fn exchange(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
        retry: bool,
    ) -> Result<(MessageType, Vec<u8>), IpcClientError> {
        let reused = self.stream.is_some();
        match self.exchange_once(msg_type, payload).await {
            Err(IpcClientError::Closed | IpcClientError::Protocol(ProtocolError::Io(_))) if reused && retry => {
                // the daemon drops idle connections; retry once on a fresh one
                debug!("cached connection went stale, reconnecting");
                self.stream = None;
                self.exchange_once(msg_type, payload).await
            }
            result => result,
        }
    }

    async fn exchange_once(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(MessageType, Vec<u8>), IpcClientError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        let timeout = self.timeout;
        let max_response = self.max_response;
        let Some(stream) = self.stream.as_mut() else {
            return Err(IpcClientError::Closed);
        };

        let result = tokio::time::timeout(timeout, async {
            codec::write_frame(stream, msg_type, payload).await?;
            codec::read_frame(stream, max_response).await
        })
        .await;

        match result {
            Ok(Ok(Some((header, body)))) => Ok((header.msg_type, body)),
            Ok(Ok(None)) => {
                self.stream = None;
                Err(IpcClientError::Closed)
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(e.into())
            }
            Err(_) => {
                self.stream = None;
                Err(IpcClientError::Timeout(timeout))
            }
        }
    }

    /// Send a raw request and return the raw response envelope.
    pub async fn request(&mut self, request: &Request) -> Result<Response, IpcClientError> {
        let payload = serde_json::to_vec(request)?;
        let retry = Command::from_request(request).is_ok_and(|command| command.is_read_only());
        let (msg_type, body) = self.exchange(MessageType::Request, &payload, retry).await?;
        if msg_type != MessageType::Response {
            return Err(IpcClientError::UnexpectedFrame(msg_type));
        }
        let response: Response = serde_json::from_slice(&body)?;
        if response.request_id != request.request_id {
            warn!(expected = %request.request_id, actual = %response.request_id, "request id mismatch");
            return Err(IpcClientError::RequestIdMismatch {
                expected: request.request_id.clone(),
                actual: response.request_id,
            });
        }
        Ok(response)
    }

    async fn call<T: DeserializeOwned>(
        &mut self,
        command: &str,
        params: Option<Value>,
    ) -> Result<T, IpcClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = Request::new(command, id);
        request.params = params;
        Ok(self.request(&request).await?.into_data()?)
    }

    // ── Typed API methods ──────────────────────────────────────────────

    pub async fn status(&mut self) -> Result<StatusData, IpcClientError> {
        self.call("status", None).await
    }

    pub async fn stats(&mut self) -> Result<StatsData, IpcClientError> {
        self.call("get_stats", None).await
    }

    pub async fn events(&mut self, params: GetEventsParams) -> Result<EventsData, IpcClientError> {
        self.call("get_events", Some(serde_json::to_value(params)?)).await
    }

    /// Stored events, newest first. Fails with `StorageDisabled` when the
    /// daemon runs without a database.
    pub async fn history(&mut self, params: GetHistoryParams) -> Result<EventsData, IpcClientError> {
        self.call("get_history", Some(serde_json::to_value(params)?)).await
    }

    pub async fn reload_rules(&mut self, rules_path: Option<&str>) -> Result<ReloadData, IpcClientError> {
        let params = rules_path.map(|path| json!({ "rules_path": path }));
        self.call("reload_rules", params).await
    }

    pub async fn restart_engine(&mut self) -> Result<RestartData, IpcClientError> {
        self.call("restart_engine", None).await
    }

    pub async fn shutdown(&mut self) -> Result<ShutdownData, IpcClientError> {
        self.call("shutdown", None).await
    }

    pub async fn heartbeat(&mut self) -> Result<HeartbeatData, IpcClientError> {
        let (msg_type, body) = self.exchange(MessageType::Heartbeat, b"{}", true).await?;
        if msg_type != MessageType::Heartbeat {
            return Err(IpcClientError::UnexpectedFrame(msg_type));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UnixListener;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut client =
            IpcClient::new(Endpoint::Path(dir.path().join("missing.sock"))).with_reconnect(policy(5));

        let started = tokio::time::Instant::now();
        let err = client.connect().await.unwrap_err();
        match err {
            IpcClientError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other}"),
        }
        // 100 + 200 + 400 + 800 ms between five attempts
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connects_once_daemon_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");
        let mut client = IpcClient::new(Endpoint::Path(path.clone())).with_reconnect(policy(20));

        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = UnixListener::bind(&path).unwrap();
            let _ = listener.accept().await;
        });

        client.connect().await.unwrap();
        assert!(client.is_connected());
        binder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_id_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liar.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = codec::read_frame(&mut stream, 1024).await.unwrap();
            let reply = Response::ok(json!(999), &ShutdownData { acknowledged: true });
            codec::write_frame(&mut stream, MessageType::Response, &serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
        });

        let mut client = IpcClient::new(Endpoint::Path(path)).with_reconnect(ReconnectPolicy::no_retry());
        let err = client.shutdown().await.unwrap_err();
        assert!(matches!(err, IpcClientError::RequestIdMismatch { .. }));
    }

    /// Serves one request per connection, then hangs up. Returns the count
    /// of requests received.
    fn one_shot_server(listener: UnixListener) -> Arc<AtomicUsize> {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(Some((_, body))) = codec::read_frame(&mut stream, 1024).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let request: Request = serde_json::from_slice(&body).unwrap();
                let reply = Response::ok(request.request_id, &json!({}));
                codec::write_frame(&mut stream, MessageType::Response, &serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });
        received
    }

    #[tokio::test]
    async fn test_stale_connection_resends_queries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oneshot.sock");
        let received = one_shot_server(UnixListener::bind(&path).unwrap());
        let mut client = IpcClient::new(Endpoint::Path(path)).with_reconnect(ReconnectPolicy::no_retry());

        assert!(client.request(&Request::new("status", 1)).await.unwrap().is_ok());
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // the server hung up; a query goes out again on a new connection
        assert!(client.request(&Request::new("status", 2)).await.unwrap().is_ok());
        assert_eq!(received.load(Ordering::SeqCst), 2);

        // a state-changing command is reported, not repeated
        let err = client.request(&Request::new("restart_engine", 3)).await.unwrap_err();
        assert!(matches!(
            err,
            IpcClientError::Closed | IpcClientError::Protocol(ProtocolError::Io(_))
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert!(!client.is_connected());

        // the next call opens a fresh connection
        assert!(client.request(&Request::new("restart_engine", 4)).await.unwrap().is_ok());
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_response_may_exceed_request_frame_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let (_, body) = codec::read_frame(&mut stream, 1024).await.unwrap().unwrap();
                let request: Request = serde_json::from_slice(&body).unwrap();
                let reply = Response::ok(request.request_id, &json!({ "blob": "x".repeat(8192) }));
                codec::write_frame(&mut stream, MessageType::Response, &serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });

        let config = IpcConfig {
            socket_path: path.display().to_string(),
            max_frame_bytes: 1024,
            reconnect_max_attempts: 1,
            ..IpcConfig::default()
        };
        let mut client = IpcClient::from_config(&config);
        assert!(client.request(&Request::new("get_events", 1)).await.unwrap().is_ok());

        let mut client = client.with_max_response(4096);
        let err = client.request(&Request::new("get_events", 2)).await.unwrap_err();
        assert!(matches!(
            err,
            IpcClientError::Protocol(ProtocolError::PayloadTooLarge { limit: 4096, .. })
        ));
    }
}
