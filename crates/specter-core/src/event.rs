use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Raw probe events
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the observed process the payload crossed.
///
/// `Ingress` is data the process read off a socket, `Egress` is data it
/// wrote. Orientation relative to the *connection* (request vs response)
/// is decided later, once the server side of the tuple is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Transport protocol of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// The syscall that produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Syscall {
    Read,
    Write,
    Sendto,
    Recvfrom,
    Readv,
    Writev,
    Close,
}

/// One socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The 4-tuple plus transport, as reported by the probe. `src` is the
/// sender of the payload, `dst` the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub transport: Transport,
}

impl FiveTuple {
    /// Canonical connection key for this tuple. Identical for both flow
    /// directions, so it can be computed (and hashed for lane routing)
    /// before the server side has been identified.
    pub fn key(&self) -> ConnectionKey {
        let (a, b) = if self.src <= self.dst {
            (self.src, self.dst)
        } else {
            (self.dst, self.src)
        };
        ConnectionKey {
            a,
            b,
            transport: self.transport,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// One raw syscall-level event from the kernel probe bridge.
///
/// `syscall == Close` carries no payload and tears the connection down.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub direction: Direction,
    pub tuple: FiveTuple,
    pub syscall: Syscall,
    pub payload: Bytes,
    /// The probe truncated the payload (its per-event capture cap is
    /// smaller than the syscall's byte count).
    pub truncated: bool,
}

impl RawEvent {
    pub fn is_close(&self) -> bool {
        self.syscall == Syscall::Close
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection identity
// ─────────────────────────────────────────────────────────────────────────────

/// Normalized connection identity: the two endpoints in canonical order
/// plus the transport. Which endpoint is the server is *not* part of the
/// key — it is recorded on the connection state once known, so that both
/// flow directions index the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    a: Endpoint,
    b: Endpoint,
    transport: Transport,
}

impl ConnectionKey {
    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        (self.a, self.b)
    }

    /// The other endpoint of the pair.
    pub fn peer_of(&self, e: Endpoint) -> Endpoint {
        if e == self.a { self.b } else { self.a }
    }

    /// Stable hash used to pin the connection to a worker lane.
    pub fn lane_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

/// Orientation of a message relative to the connection: toward the
/// server is a request, toward the client a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Request,
    Response,
}

impl MessageDirection {
    pub fn flip(self) -> Self {
        match self {
            Self::Request => Self::Response,
            Self::Response => Self::Request,
        }
    }
}
