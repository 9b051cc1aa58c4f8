//! End-to-end tests: a real in-process daemon with a fake engine, driven
//! over its control socket.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};

use vnids_config::OverflowPolicy;
use vnids_core::EngineState;
use vnids_core::codec::{self, HEADER_LEN, MessageType};
use vnids_core::engine::fake::FakeSignal;
use vnids_core::ipc::{ErrorCode, GetEventsParams, IpcClientError, Request, Response};
use vnids_test_utils::daemon::{TestDaemon, wait_until};
use vnids_test_utils::fixtures;

async fn raw_request(stream: &mut UnixStream, payload: &[u8]) -> Response {
    codec::write_frame(stream, MessageType::Request, payload).await.unwrap();
    let (header, body) = codec::read_frame(stream, 1 << 20).await.unwrap().unwrap();
    assert_eq!(header.msg_type, MessageType::Response);
    serde_json::from_slice(&body).unwrap()
}

#[test_log::test(tokio::test)]
async fn status_echoes_request_id() {
    let daemon = TestDaemon::start().await;
    daemon.wait_for_engine(EngineState::Running).await;

    let mut client = daemon.client();
    let response = client.request(&Request::new("status", 1)).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(response.request_id, json!(1));

    let status = client.status().await.unwrap();
    assert!(status.daemon_running);
    assert_eq!(status.engine.state, EngineState::Running);
    assert_eq!(status.engine.pid, Some(daemon.launcher.latest().unwrap().pid()));

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn eve_lines_become_events() {
    let daemon = TestDaemon::start().await;
    let mut lines = vec![
        fixtures::alert_line(1, 2_000_001, 1),
        fixtures::flow_line(2),
        fixtures::alert_line(3, 2_000_002, 4),
        fixtures::stats_line(5000, 7),
    ];
    lines.extend(fixtures::malformed_lines());
    lines.push(fixtures::alert_line(4, 2_000_003, 2));
    daemon.append_eve(&lines).await;
    daemon.wait_for_lines(lines.len() as u64).await;

    let mut client = daemon.client();
    let events = client.events(GetEventsParams::default()).await.unwrap();
    let flow_ids: Vec<_> = events.events.iter().map(|e| e.flow_id.unwrap()).collect();
    assert_eq!(flow_ids, vec![1, 2, 3, 4]);

    let severe = client
        .events(GetEventsParams {
            severity_max: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    let flow_ids: Vec<_> = severe.events.iter().map(|e| e.flow_id.unwrap()).collect();
    assert_eq!(flow_ids, vec![1, 4]);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.events_processed, 4);
    assert_eq!(stats.parse_errors, 4);
    assert_eq!(stats.alerts_total, 3);
    assert_eq!(stats.flows_total, 1);
    assert_eq!(stats.queue_len, 4);
    let engine = stats.engine.unwrap();
    assert_eq!(engine.kernel_packets, 5000);
    assert_eq!(engine.kernel_drops, 7);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn full_queue_keeps_first_records() {
    let daemon = TestDaemon::start_with(|b| b.queue_capacity(5)).await;
    let lines: Vec<_> = (0..10).map(|i| fixtures::alert_line(i, 2_000_000 + i, 3)).collect();
    daemon.append_eve(&lines).await;
    daemon.wait_for_lines(10).await;

    let mut client = daemon.client();
    let events = client.events(GetEventsParams::default()).await.unwrap();
    let flow_ids: Vec<_> = events.events.iter().map(|e| e.flow_id.unwrap()).collect();
    assert_eq!(flow_ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(client.status().await.unwrap().dropped_events, 5);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn drop_oldest_keeps_latest_records() {
    let daemon = TestDaemon::start_with(|b| {
        b.queue_capacity(5).overflow_policy(OverflowPolicy::DropOldest)
    })
    .await;
    let lines: Vec<_> = (0..10).map(|i| fixtures::alert_line(i, 2_000_000 + i, 3)).collect();
    daemon.append_eve(&lines).await;
    daemon.wait_for_lines(10).await;

    let mut client = daemon.client();
    let events = client.events(GetEventsParams::default()).await.unwrap();
    let flow_ids: Vec<_> = events.events.iter().map(|e| e.flow_id.unwrap()).collect();
    assert_eq!(flow_ids, vec![5, 6, 7, 8, 9]);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn crash_is_restarted_and_reported() {
    let daemon = TestDaemon::start().await;
    daemon.wait_for_engine(EngineState::Running).await;

    daemon.launcher.latest().unwrap().crash();
    let launcher = daemon.launcher.clone();
    wait_until(|| launcher.spawn_count() == 2).await;
    daemon.wait_for_engine(EngineState::Running).await;

    let status = daemon.client().status().await.unwrap();
    assert_eq!(status.engine.restart_count, 1);
    assert_eq!(status.engine.last_exit.unwrap().code, Some(1));

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn failed_engine_needs_operator_restart() {
    let daemon = TestDaemon::start_with(|b| b.max_restarts(2)).await;
    daemon.wait_for_engine(EngineState::Running).await;
    daemon
        .launcher
        .exit_on_spawn(Some(vnids_core::engine::EngineExit::code(1)));
    daemon.launcher.latest().unwrap().crash();
    daemon.wait_for_engine(EngineState::Failed).await;

    let mut client = daemon.client();
    // read-only commands keep working
    assert_eq!(client.stats().await.unwrap().state, EngineState::Failed);

    daemon.launcher.exit_on_spawn(None);
    let restarted = client.restart_engine().await.unwrap();
    assert_eq!(restarted.state, EngineState::Starting);
    daemon.wait_for_engine(EngineState::Running).await;

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn reload_rules_signals_engine() {
    let daemon = TestDaemon::start().await;
    daemon.wait_for_engine(EngineState::Running).await;
    let rules = daemon.dir().join("rules-v2");
    std::fs::create_dir(&rules).unwrap();

    let mut client = daemon.client();
    let reload = client.reload_rules(None).await.unwrap();
    assert!(reload.applied);
    assert!(!reload.restarted);
    assert_eq!(daemon.launcher.latest().unwrap().signals(), vec![FakeSignal::Reload]);

    let reload = client.reload_rules(rules.to_str()).await.unwrap();
    assert!(reload.applied);
    assert!(reload.restarted);
    assert_eq!(reload.rules_path, rules.display().to_string());
    assert_eq!(daemon.launcher.spawn_count(), 2);
    assert_eq!(daemon.launcher.latest().unwrap().rules_dir(), rules.as_path());
    assert_eq!(daemon.launcher.last_spec().unwrap().rules_dir, rules);

    let err = client.reload_rules(Some("/nonexistent/rules")).await.unwrap_err();
    match err {
        IpcClientError::Daemon(vnids_core::ipc::ResponseError::Daemon(body)) => {
            assert_eq!(body.code, ErrorCode::BadRequest)
        }
        other => panic!("unexpected error: {other}"),
    }

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn malformed_json_keeps_connection_open() {
    let daemon = TestDaemon::start().await;
    let mut stream = UnixStream::connect(daemon.socket_path()).await.unwrap();

    let response = raw_request(&mut stream, b"{\"command\": ").await;
    assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);

    let response = raw_request(&mut stream, br#"{"command":"get_everything","request_id":"q"}"#).await;
    assert_eq!(response.request_id, json!("q"));
    assert_eq!(response.error.unwrap().code, ErrorCode::UnknownCommand);

    let response = raw_request(&mut stream, br#"{"command":"status","request_id":7}"#).await;
    assert!(response.is_ok());
    assert_eq!(response.request_id, json!(7));

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn bad_magic_closes_connection() {
    let daemon = TestDaemon::start().await;
    let mut stream = UnixStream::connect(daemon.socket_path()).await.unwrap();

    let mut frame = codec::encode_message(MessageType::Request, br#"{"command":"status"}"#).unwrap();
    frame[0] = b'X';
    stream.write_all(&frame).await.unwrap();

    let (_, body) = codec::read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
    let response: Response = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.request_id, Value::Null);
    assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);
    assert!(codec::read_frame(&mut stream, 1 << 20).await.unwrap().is_none());

    // the daemon itself is unaffected
    assert!(daemon.client().status().await.is_ok());
    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn heartbeat_and_foreign_frames() {
    let daemon = TestDaemon::start().await;
    assert!(daemon.client().heartbeat().await.is_ok());

    let mut stream = UnixStream::connect(daemon.socket_path()).await.unwrap();
    codec::write_frame(&mut stream, MessageType::Event, b"{}").await.unwrap();
    let (header, body) = codec::read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
    assert_eq!(header.msg_type, MessageType::Response);
    assert_eq!(header.length as usize + HEADER_LEN, header.frame_len());
    let response: Response = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn shutdown_command_stops_daemon() {
    let daemon = TestDaemon::start().await;
    daemon.wait_for_engine(EngineState::Running).await;
    let engine = daemon.launcher.latest().unwrap();
    let socket = daemon.socket_path();

    let ack = daemon.client().shutdown().await.unwrap();
    assert!(ack.acknowledged);

    daemon.stop().await;
    assert!(engine.has_exited());
    assert!(!socket.exists());
}

#[test_log::test(tokio::test)]
async fn events_from_engine_socket() {
    let dir = tempfile::tempdir().unwrap();
    let eve_path = dir.path().join("eve.sock");
    let listener = UnixListener::bind(&eve_path).unwrap();
    let eve = eve_path.display().to_string();

    let daemon = TestDaemon::start_with(|b| b.eve_socket(&eve)).await;
    let (mut engine_side, _) = listener.accept().await.unwrap();
    for i in 0..3 {
        let line = fixtures::alert_line(i, 2_000_100 + i, 2) + "\n";
        engine_side.write_all(line.as_bytes()).await.unwrap();
    }
    daemon.wait_for_lines(3).await;

    let events = daemon.client().events(GetEventsParams::default()).await.unwrap();
    assert_eq!(events.count, 3);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn stalled_client_is_closed_after_timeout() {
    let daemon = TestDaemon::start_with(|b| b.request_timeout_ms(200)).await;
    daemon.wait_for_engine(EngineState::Running).await;

    // half a header, then nothing
    let frame = codec::encode_message(MessageType::Request, br#"{"command":"status"}"#).unwrap();
    let mut stalled = UnixStream::connect(daemon.socket_path()).await.unwrap();
    stalled.write_all(&frame[..HEADER_LEN / 2]).await.unwrap();
    let started = tokio::time::Instant::now();

    let status = daemon.client().status().await.unwrap();
    assert_eq!(status.engine.state, EngineState::Running);

    let closed = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        codec::read_frame(&mut stalled, 1 << 20),
    )
    .await
    .expect("stalled connection was never closed");
    assert!(!matches!(closed, Ok(Some(_))));
    assert!(started.elapsed() >= std::time::Duration::from_millis(150));

    // a fresh connection still gets served
    assert!(daemon.client().status().await.is_ok());
    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn drain_on_read_consumes_returned_events() {
    let daemon = TestDaemon::start_with(|b| b.drain_on_read(true)).await;
    let lines: Vec<_> = (0..4).map(|i| fixtures::alert_line(i, 2_000_200 + i, 3)).collect();
    daemon.append_eve(&lines).await;
    daemon.wait_for_lines(4).await;

    let mut client = daemon.client();
    let first = client
        .events(GetEventsParams {
            limit: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.count, 3);

    let rest = client.events(GetEventsParams::default()).await.unwrap();
    let flow_ids: Vec<_> = rest.events.iter().map(|e| e.flow_id.unwrap()).collect();
    assert_eq!(flow_ids, vec![3]);
    assert_eq!(client.status().await.unwrap().queue_len, 0);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn get_events_limit_is_capped() {
    let daemon = TestDaemon::start_with(|b| b.max_events(2)).await;
    let lines: Vec<_> = (0..5).map(|i| fixtures::alert_line(i, 2_000_300 + i, 3)).collect();
    daemon.append_eve(&lines).await;
    daemon.wait_for_lines(5).await;

    let events = daemon
        .client()
        .events(GetEventsParams {
            limit: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.count, 2);

    daemon.stop().await;
}
