//! IPC record format shared by the Unix-socket bridge and replay files.
//! Must match the native bridge's serializer.

use std::net::IpAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use specter_core::event::{Direction, Endpoint, FiveTuple, RawEvent, Syscall, Transport};

/// One syscall event as serialized by the probe bridge. Payload bytes
/// travel base64-encoded; `payload_b64` is absent for close events.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    pub direction: Direction,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    pub syscall: Syscall,
    #[serde(default)]
    pub payload_b64: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

impl BridgeEvent {
    /// Decode into the analyzer's event type. `None` when the payload
    /// base64 is damaged.
    pub fn into_event(self) -> Option<RawEvent> {
        let payload = match self.payload_b64 {
            Some(b64) => Bytes::from(B64.decode(b64).ok()?),
            None => Bytes::new(),
        };
        Some(RawEvent {
            timestamp_ns: self.timestamp_ns,
            pid: self.pid,
            tid: self.tid,
            direction: self.direction,
            tuple: FiveTuple {
                src: Endpoint::new(self.src_ip, self.src_port),
                dst: Endpoint::new(self.dst_ip, self.dst_port),
                transport: self.transport,
            },
            syscall: self.syscall,
            payload,
            truncated: self.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_event_decodes() {
        let json = r#"{
            "timestamp_ns": 1000,
            "pid": 42,
            "direction": "ingress",
            "src_ip": "10.0.0.1",
            "src_port": 51234,
            "dst_ip": "10.0.0.2",
            "dst_port": 80,
            "transport": "tcp",
            "syscall": "read",
            "payload_b64": "R0VUIC8gSFRUUC8xLjENCg0K"
        }"#;
        let bridge: BridgeEvent = serde_json::from_str(json).unwrap();
        let event = bridge.into_event().unwrap();

        assert_eq!(event.timestamp_ns, 1000);
        assert_eq!(event.pid, 42);
        assert_eq!(event.tuple.dst.port, 80);
        assert_eq!(&event.payload[..], b"GET / HTTP/1.1\r\n\r\n");
        assert!(!event.truncated);
    }

    #[test]
    fn test_close_event_has_no_payload() {
        let json = r#"{
            "timestamp_ns": 2000,
            "pid": 42,
            "direction": "egress",
            "src_ip": "10.0.0.1",
            "src_port": 51234,
            "dst_ip": "10.0.0.2",
            "dst_port": 80,
            "syscall": "close"
        }"#;
        let bridge: BridgeEvent = serde_json::from_str(json).unwrap();
        let event = bridge.into_event().unwrap();
        assert!(event.is_close());
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_damaged_base64_is_dropped() {
        let json = r#"{
            "timestamp_ns": 3000,
            "pid": 42,
            "direction": "ingress",
            "src_ip": "10.0.0.1",
            "src_port": 51234,
            "dst_ip": "10.0.0.2",
            "dst_port": 80,
            "syscall": "read",
            "payload_b64": "not!!base64"
        }"#;
        let bridge: BridgeEvent = serde_json::from_str(json).unwrap();
        assert!(bridge.into_event().is_none());
    }
}
