use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::{ConnectionKey, Endpoint, MessageDirection};

// ─────────────────────────────────────────────────────────────────────────────
// Protocol tags
// ─────────────────────────────────────────────────────────────────────────────

/// Application protocol carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Unknown,
    Http,
    Mysql,
    Redis,
    Dns,
    Kafka,
    Dubbo,
    Rocketmq,
    Generic,
}

impl Protocol {
    pub const ALL: [Protocol; 9] = [
        Protocol::Unknown,
        Protocol::Http,
        Protocol::Mysql,
        Protocol::Redis,
        Protocol::Dns,
        Protocol::Kafka,
        Protocol::Dubbo,
        Protocol::Rocketmq,
        Protocol::Generic,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Http => "http",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Dns => "dns",
            Self::Kafka => "kafka",
            Self::Dubbo => "dubbo",
            Self::Rocketmq => "rocketmq",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attributes
// ─────────────────────────────────────────────────────────────────────────────

/// Attribute value recorded by a decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload messages
// ─────────────────────────────────────────────────────────────────────────────

/// One decoder-level message: the bytes of one application request or
/// response plus the attributes a decoder extracted from them.
#[derive(Debug, Clone)]
pub struct PayloadMessage {
    /// Raw payload bytes. May span several syscalls (reassembled by the
    /// tracker) and may be truncated by the probe's capture cap.
    pub data: Bytes,
    pub direction: MessageDirection,
    pub timestamp_ns: u64,
    pub key: ConnectionKey,
    pub truncated: bool,
    /// Correlation id for id-matched protocols (DNS transaction id,
    /// Dubbo request id, Kafka correlation id, RocketMQ opaque).
    pub correlation_id: Option<i64>,
    pub is_error: bool,
    /// Control traffic (server greetings, heartbeats). Locks protocol
    /// identification like any other parse but stays out of
    /// request/response matching.
    pub control: bool,
    attributes: HashMap<String, AttrValue>,
}

impl PayloadMessage {
    pub fn new(
        data: Bytes,
        direction: MessageDirection,
        timestamp_ns: u64,
        key: ConnectionKey,
    ) -> Self {
        Self {
            data,
            direction,
            timestamp_ns,
            key,
            truncated: false,
            correlation_id: None,
            is_error: false,
            control: false,
            attributes: HashMap::new(),
        }
    }

    pub fn put_str(&mut self, name: &str, value: impl Into<String>) {
        self.attributes
            .insert(name.to_string(), AttrValue::Str(value.into()));
    }

    pub fn put_int(&mut self, name: &str, value: i64) {
        self.attributes
            .insert(name.to_string(), AttrValue::Int(value));
    }

    pub fn put_bool(&mut self, name: &str, value: bool) {
        self.attributes
            .insert(name.to_string(), AttrValue::Bool(value));
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttrValue::as_str)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attributes.get(name).and_then(AttrValue::as_int)
    }

    pub fn attributes(&self) -> &HashMap<String, AttrValue> {
        &self.attributes
    }

    /// Drop the payload bytes, keeping only the extracted attributes.
    /// Called before a message is parked in a pending queue so held
    /// memory is bounded by attribute size, not payload size.
    pub fn release_data(&mut self) {
        self.data = Bytes::new();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matched pairs
// ─────────────────────────────────────────────────────────────────────────────

/// Why a pair was emitted without its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairError {
    Timeout,
    Shutdown,
}

impl PairError {
    pub fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A matched request/response exchange, ready for enrichment and export.
///
/// At least one side is always present: both for normal pairs, only the
/// request for timeout/shutdown flushes, only the response for orphan
/// responses that arrived with nothing pending. `attributes` is the
/// merged map (request first, response layered on top); the enricher
/// adds workload identity to it before export.
#[derive(Debug, Clone)]
pub struct MessagePair {
    pub protocol: Protocol,
    pub request: Option<PayloadMessage>,
    pub response: Option<PayloadMessage>,
    pub latency_ns: u64,
    pub is_error: bool,
    pub error_kind: Option<PairError>,
    pub server: Option<Endpoint>,
    pub client: Option<Endpoint>,
    /// Pid of the observed process, for metadata lookups. Zero when the
    /// probe did not report one.
    pub pid: u32,
    pub attributes: HashMap<String, AttrValue>,
}

impl MessagePair {
    fn build(
        protocol: Protocol,
        request: Option<PayloadMessage>,
        response: Option<PayloadMessage>,
        error_kind: Option<PairError>,
    ) -> Self {
        let latency_ns = match (&request, &response) {
            (Some(req), Some(resp)) => resp.timestamp_ns.saturating_sub(req.timestamp_ns),
            _ => 0,
        };
        let is_error = error_kind.is_some()
            || request.as_ref().is_some_and(|m| m.is_error)
            || response.as_ref().is_some_and(|m| m.is_error);

        let mut attributes = HashMap::new();
        if let Some(req) = &request {
            attributes.extend(req.attributes().clone());
        }
        if let Some(resp) = &response {
            attributes.extend(resp.attributes().clone());
        }
        if let Some(kind) = error_kind {
            attributes.insert(
                "error.kind".to_string(),
                AttrValue::Str(kind.name().to_string()),
            );
        }

        Self {
            protocol,
            request,
            response,
            latency_ns,
            is_error,
            error_kind,
            server: None,
            client: None,
            pid: 0,
            attributes,
        }
    }

    pub fn complete(protocol: Protocol, request: PayloadMessage, response: PayloadMessage) -> Self {
        Self::build(protocol, Some(request), Some(response), None)
    }

    pub fn orphan_response(protocol: Protocol, response: PayloadMessage) -> Self {
        Self::build(protocol, None, Some(response), None)
    }

    pub fn unanswered(protocol: Protocol, request: PayloadMessage, error_kind: PairError) -> Self {
        Self::build(protocol, Some(request), None, Some(error_kind))
    }

    pub fn key(&self) -> ConnectionKey {
        // The constructors guarantee one side is present.
        self.request
            .as_ref()
            .or(self.response.as_ref())
            .map(|m| m.key)
            .expect("pair with neither request nor response")
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.request
            .as_ref()
            .or(self.response.as_ref())
            .map(|m| m.timestamp_ns)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Endpoint, FiveTuple, Transport};

    fn key() -> ConnectionKey {
        FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 80),
            transport: Transport::Tcp,
        }
        .key()
    }

    fn msg(direction: MessageDirection, ts: u64) -> PayloadMessage {
        PayloadMessage::new(Bytes::new(), direction, ts, key())
    }

    #[test]
    fn test_attr_roundtrip() {
        let mut m = msg(MessageDirection::Request, 0);
        m.put_str("http.method", "GET");
        m.put_int("http.status_code", 200);
        m.put_bool("flag", true);

        assert_eq!(m.str_attr("http.method"), Some("GET"));
        assert_eq!(m.int_attr("http.status_code"), Some(200));
        assert_eq!(m.attr("flag").and_then(AttrValue::as_bool), Some(true));
        assert!(m.attr("missing").is_none());
    }

    #[test]
    fn test_pair_latency_and_merge() {
        let mut req = msg(MessageDirection::Request, 1_000);
        req.put_str("http.method", "GET");
        req.put_str("shared", "from-request");
        let mut resp = msg(MessageDirection::Response, 4_500);
        resp.put_int("http.status_code", 200);
        resp.put_str("shared", "from-response");

        let pair = MessagePair::complete(Protocol::Http, req, resp);
        assert_eq!(pair.latency_ns, 3_500);
        assert!(!pair.is_error);
        assert_eq!(pair.attributes["http.method"], AttrValue::Str("GET".into()));
        assert_eq!(
            pair.attributes["shared"],
            AttrValue::Str("from-response".into())
        );
    }

    #[test]
    fn test_pair_latency_saturates_on_clock_skew() {
        let req = msg(MessageDirection::Request, 9_000);
        let resp = msg(MessageDirection::Response, 1_000);
        let pair = MessagePair::complete(Protocol::Http, req, resp);
        assert_eq!(pair.latency_ns, 0);
    }

    #[test]
    fn test_unanswered_pair_is_error() {
        let pair = MessagePair::unanswered(
            Protocol::Mysql,
            msg(MessageDirection::Request, 0),
            PairError::Timeout,
        );
        assert!(pair.is_error);
        assert_eq!(
            pair.attributes["error.kind"],
            AttrValue::Str("timeout".into())
        );
    }

    #[test]
    fn test_protocol_serde_lowercase() {
        let json = serde_json::to_string(&Protocol::Rocketmq).unwrap();
        assert_eq!(json, "\"rocketmq\"");
        let back: Protocol = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(back, Protocol::Http);
    }
}
