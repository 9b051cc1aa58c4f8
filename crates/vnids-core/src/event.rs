//! Normalized event records parsed from the engine's EVE JSON stream.
//!
//! One EVE line is one self-contained JSON object. [`parse_line`] turns it
//! into either an [`EventRecord`] destined for the queue or an
//! [`EngineStats`] snapshot. Anything that fails validation is a
//! [`ParseError`] and never becomes a record.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// EVE timestamp layout: `2024-01-15T10:30:00.123456+0000`.
const EVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Errors from turning one engine line into a record.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("severity {0} is outside 1..=5")]
    SeverityOutOfRange(i64),

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("line of {len} bytes exceeds limit of {limit}")]
    LineTooLong { len: usize, limit: usize },
}

/// Alert severity: 1 is critical, 5 is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Severity(u8);

impl Severity {
    pub const CRITICAL: Severity = Severity(1);
    pub const INFORMATIONAL: Severity = Severity(5);

    pub fn new(value: i64) -> Result<Self, ParseError> {
        match u8::try_from(value) {
            Ok(v @ 1..=5) => Ok(Severity(v)),
            _ => Err(ParseError::SeverityOutOfRange(value)),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Severity {
    type Error = ParseError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Severity::new(value)
    }
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EVE `event_type`. Kinds the daemon does not interpret are kept by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Alert,
    Flow,
    Anomaly,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Flow => "flow",
            EventKind::Anomaly => "anomaly",
            EventKind::Other(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "alert" => EventKind::Alert,
            "flow" => EventKind::Flow,
            "anomaly" => EventKind::Anomaly,
            _ => EventKind::Other(name),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> String {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `alert` sub-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInfo {
    pub signature_id: u64,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// `flow` sub-record: counters and teardown details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowInfo {
    #[serde(default)]
    pub pkts_toserver: u64,
    #[serde(default)]
    pub pkts_toclient: u64,
    #[serde(default)]
    pub bytes_toserver: u64,
    #[serde(default)]
    pub bytes_toclient: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerted: Option<bool>,
}

/// `anomaly` sub-record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyInfo {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

/// One normalized engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<u64>,
    pub event_type: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_iface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyInfo>,
}

impl EventRecord {
    /// A bare record of the given kind; the builder style used by tests
    /// and fixtures.
    pub fn new(timestamp: DateTime<Utc>, event_type: EventKind) -> Self {
        Self {
            timestamp,
            flow_id: None,
            event_type,
            src_ip: None,
            dest_ip: None,
            src_port: None,
            dest_port: None,
            proto: None,
            app_proto: None,
            in_iface: None,
            alert: None,
            flow: None,
            anomaly: None,
        }
    }

    pub fn with_flow_id(mut self, flow_id: u64) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn with_alert(mut self, signature_id: u64, severity: Severity) -> Self {
        self.alert = Some(AlertInfo {
            signature_id,
            severity,
            gid: None,
            rev: None,
            signature: None,
            category: None,
            action: None,
        });
        self
    }

    /// Severity of the alert sub-record, if any.
    pub fn severity(&self) -> Option<Severity> {
        self.alert.as_ref().map(|a| a.severity)
    }

    /// Severity used for filtering: records without one rank as informational.
    pub fn effective_severity(&self) -> Severity {
        self.severity().unwrap_or(Severity::INFORMATIONAL)
    }
}

/// Latest counters reported by an EVE `stats` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub kernel_packets: u64,
    pub kernel_drops: u64,
    pub decoder_bytes: u64,
    pub detect_alerts: u64,
    pub flows_active: u64,
    pub flow_memuse: u64,
    pub uptime_seconds: u64,
    pub reported_at: Option<DateTime<Utc>>,
}

impl EngineStats {
    fn from_value(stats: &Value, reported_at: DateTime<Utc>) -> Self {
        let counter = |section: &str, key: &str| {
            stats
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Self {
            kernel_packets: counter("capture", "kernel_packets"),
            kernel_drops: counter("capture", "kernel_drops"),
            decoder_bytes: counter("decoder", "bytes"),
            detect_alerts: counter("detect", "alert"),
            flows_active: counter("flow_mgr", "flows_active"),
            flow_memuse: counter("flow", "memuse"),
            uptime_seconds: stats.get("uptime").and_then(Value::as_u64).unwrap_or(0),
            reported_at: Some(reported_at),
        }
    }
}

/// What a single EVE line turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum EveLine {
    Event(EventRecord),
    Stats(EngineStats),
}

/// Wire shape of an EVE line before validation.
#[derive(Deserialize)]
struct RawEve {
    timestamp: Option<String>,
    event_type: Option<String>,
    flow_id: Option<i64>,
    src_ip: Option<IpAddr>,
    dest_ip: Option<IpAddr>,
    src_port: Option<u16>,
    dest_port: Option<u16>,
    proto: Option<String>,
    app_proto: Option<String>,
    in_iface: Option<String>,
    alert: Option<RawAlert>,
    flow: Option<FlowInfo>,
    anomaly: Option<AnomalyInfo>,
    stats: Option<Value>,
}

#[derive(Deserialize)]
struct RawAlert {
    signature_id: Option<u64>,
    severity: Option<i64>,
    gid: Option<u32>,
    rev: Option<u32>,
    signature: Option<String>,
    category: Option<String>,
    action: Option<String>,
}

impl RawAlert {
    fn validate(self) -> Result<AlertInfo, ParseError> {
        let signature_id = self
            .signature_id
            .ok_or(ParseError::MissingField("alert.signature_id"))?;
        let severity = Severity::new(self.severity.ok_or(ParseError::MissingField("alert.severity"))?)?;
        Ok(AlertInfo {
            signature_id,
            severity,
            gid: self.gid,
            rev: self.rev,
            signature: self.signature,
            category: self.category,
            action: self.action,
        })
    }
}

/// Parse an engine timestamp.
///
/// Accepts the EVE layout (`+0000` offsets, optional fraction) and RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_str(s, EVE_TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ParseError::InvalidTimestamp(s.to_string()))
}

/// Parse and validate one EVE JSON line.
pub fn parse_line(line: &str) -> Result<EveLine, ParseError> {
    let raw: RawEve = serde_json::from_str(line)?;

    let event_type = raw.event_type.ok_or(ParseError::MissingField("event_type"))?;
    let timestamp = parse_timestamp(
        raw.timestamp
            .as_deref()
            .ok_or(ParseError::MissingField("timestamp"))?,
    )?;

    if event_type == "stats" {
        let stats = raw.stats.ok_or(ParseError::MissingField("stats"))?;
        return Ok(EveLine::Stats(EngineStats::from_value(&stats, timestamp)));
    }

    let kind = EventKind::from(event_type);
    let flow_id = match raw.flow_id {
        Some(id) if id < 0 => {
            return Err(ParseError::InvalidField {
                field: "flow_id",
                reason: format!("{id} is negative"),
            });
        }
        Some(id) => Some(id as u64),
        None => None,
    };

    let alert = raw.alert.map(RawAlert::validate).transpose()?;
    match kind {
        EventKind::Alert => {
            if flow_id.is_none() {
                return Err(ParseError::MissingField("flow_id"));
            }
            if alert.is_none() {
                return Err(ParseError::MissingField("alert"));
            }
        }
        EventKind::Flow => {
            if flow_id.is_none() {
                return Err(ParseError::MissingField("flow_id"));
            }
            if raw.flow.is_none() {
                return Err(ParseError::MissingField("flow"));
            }
        }
        EventKind::Anomaly | EventKind::Other(_) => {}
    }

    Ok(EveLine::Event(EventRecord {
        timestamp,
        flow_id,
        event_type: kind,
        src_ip: raw.src_ip,
        dest_ip: raw.dest_ip,
        src_port: raw.src_port,
        dest_port: raw.dest_port,
        proto: raw.proto,
        app_proto: raw.app_proto,
        in_iface: raw.in_iface,
        alert,
        flow: raw.flow,
        anomaly: raw.anomaly,
    }))
}
