//! EVE JSON lines as the engine writes them.

/// An alert line with the given flow id, signature, and severity.
pub fn alert_line(flow_id: u64, signature_id: u64, severity: u8) -> String {
    format!(
        concat!(
            r#"{{"timestamp":"2024-01-15T10:30:{:02}.123456+0000","flow_id":{},"in_iface":"eth0","#,
            r#""event_type":"alert","src_ip":"192.168.1.100","src_port":54321,"dest_ip":"10.0.0.1","#,
            r#""dest_port":80,"proto":"TCP","app_proto":"http","alert":{{"action":"allowed","gid":1,"#,
            r#""signature_id":{},"rev":1,"signature":"ET SCAN Test Signature","category":"Attempted Information Leak","#,
            r#""severity":{}}}}}"#
        ),
        flow_id % 60,
        flow_id,
        signature_id,
        severity
    )
}

/// A closed-flow line.
pub fn flow_line(flow_id: u64) -> String {
    format!(
        concat!(
            r#"{{"timestamp":"2024-01-15T10:31:00.000000+0000","flow_id":{},"event_type":"flow","#,
            r#""src_ip":"192.168.1.100","src_port":54321,"dest_ip":"10.0.0.1","dest_port":443,"proto":"TCP","#,
            r#""flow":{{"pkts_toserver":10,"pkts_toclient":8,"bytes_toserver":1200,"bytes_toclient":5400,"#,
            r#""start":"2024-01-15T10:30:00.000000+0000","end":"2024-01-15T10:31:00.000000+0000","#,
            r#""age":60,"state":"closed","reason":"timeout","alerted":false}}}}"#
        ),
        flow_id
    )
}

/// An engine stats line.
pub fn stats_line(kernel_packets: u64, kernel_drops: u64) -> String {
    format!(
        concat!(
            r#"{{"timestamp":"2024-01-15T10:32:00.000000+0000","event_type":"stats","stats":{{"uptime":120,"#,
            r#""capture":{{"kernel_packets":{},"kernel_drops":{}}},"decoder":{{"bytes":987654}},"#,
            r#""detect":{{"alert":3}},"flow_mgr":{{"flows_active":12}},"flow":{{"memuse":1048576}}}}}}"#
        ),
        kernel_packets, kernel_drops
    )
}

/// An alert whose severity is outside 1..=5.
pub fn out_of_range_alert_line() -> String {
    alert_line(1, 2_000_001, 9)
}

/// Lines that must all be rejected.
pub fn malformed_lines() -> Vec<String> {
    vec![
        "not json at all".to_string(),
        r#"{"event_type":"alert"}"#.to_string(),
        r#"{"timestamp":"2024-01-15T10:30:00.000000+0000","event_type":"alert","flow_id":1}"#
            .to_string(),
        out_of_range_alert_line(),
    ]
}
