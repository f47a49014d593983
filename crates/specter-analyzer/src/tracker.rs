//! Per-lane connection table: stream reassembly across syscalls,
//! protocol identification with a retry cap, framed-message slicing for
//! pipelined traffic, request/response matching and time-based
//! eviction. Each lane owns one table, so nothing here locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use specter_core::config::AnalyzerConfig;
use specter_core::event::{ConnectionKey, Endpoint, MessageDirection, RawEvent};
use specter_core::message::{MessagePair, PairError, PayloadMessage, Protocol};
use specter_core::metrics::AnalyzerMetrics;
use specter_protocol::{DecoderRegistry, MatchMode, ProtocolDecoder, Verdict};
use tracing::{debug, trace};

use crate::matcher::PendingStore;

/// Bytes buffered for one direction while a message is incomplete.
#[derive(Debug)]
struct PartialBuffer {
    data: Vec<u8>,
    /// Timestamp of the first fragment; the eventual message inherits it.
    timestamp_ns: u64,
    truncated: bool,
}

/// Upper bound on messages parsed out of a single reassembled buffer,
/// so a hostile payload cannot pin the lane.
const MAX_MESSAGES_PER_EVENT: usize = 64;

struct ConnectionState {
    server: Endpoint,
    pid: u32,
    protocol: Protocol,
    protocol_locked: bool,
    candidates: Vec<Protocol>,
    ident_attempts: u32,
    partial_request: Option<PartialBuffer>,
    partial_response: Option<PartialBuffer>,
    pending: PendingStore,
    created_ns: u64,
    last_active_ns: u64,
}

impl ConnectionState {
    fn partial_mut(&mut self, direction: MessageDirection) -> &mut Option<PartialBuffer> {
        match direction {
            MessageDirection::Request => &mut self.partial_request,
            MessageDirection::Response => &mut self.partial_response,
        }
    }
}

pub struct ConnectionTable {
    connections: HashMap<ConnectionKey, ConnectionState>,
    registry: Arc<DecoderRegistry>,
    metrics: AnalyzerMetrics,
    capacity: usize,
    max_pending: usize,
    max_partial: usize,
    max_ident_retries: u32,
}

impl ConnectionTable {
    pub fn new(
        config: &AnalyzerConfig,
        capacity: usize,
        registry: Arc<DecoderRegistry>,
        metrics: AnalyzerMetrics,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            registry,
            metrics,
            capacity: capacity.max(1),
            max_pending: config.max_pending_per_connection,
            max_partial: config.max_partial_buffer,
            max_ident_retries: config.identification_max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Process one probe event, returning any pairs it completed.
    pub fn handle_event(&mut self, event: &RawEvent) -> Vec<MessagePair> {
        let key = event.tuple.key();

        if event.is_close() {
            if self.connections.remove(&key).is_some() {
                self.metrics.connection_closed();
                trace!(%key, "connection closed");
            }
            return Vec::new();
        }
        if event.payload.is_empty() {
            return Vec::new();
        }

        self.ensure_connection(&key, event);
        let state = self.connections.get_mut(&key).expect("just inserted");
        state.last_active_ns = state.last_active_ns.max(event.timestamp_ns);

        // Toward the server is a request.
        let direction = if event.tuple.dst == state.server {
            MessageDirection::Request
        } else {
            MessageDirection::Response
        };

        // Prepend whatever this direction had buffered.
        let (buffer, base_ts, truncated) = match state.partial_mut(direction).take() {
            Some(mut partial) => {
                partial.data.extend_from_slice(&event.payload);
                (
                    Bytes::from(partial.data),
                    partial.timestamp_ns,
                    partial.truncated || event.truncated,
                )
            }
            None => (event.payload.clone(), event.timestamp_ns, event.truncated),
        };

        let mut pairs = Vec::new();
        self.decode_buffer(&key, direction, buffer, base_ts, truncated, &mut pairs);
        pairs
    }

    fn ensure_connection(&mut self, key: &ConnectionKey, event: &RawEvent) {
        if self.connections.contains_key(key) {
            return;
        }
        if self.connections.len() >= self.capacity {
            self.evict_lru();
        }

        // The hinted port wins; otherwise the receiver of the first
        // payload is taken for the server.
        let server = if self.registry.is_hinted_port(event.tuple.dst.port) {
            event.tuple.dst
        } else if self.registry.is_hinted_port(event.tuple.src.port) {
            event.tuple.src
        } else {
            event.tuple.dst
        };

        let state = ConnectionState {
            server,
            pid: event.pid,
            protocol: Protocol::Unknown,
            protocol_locked: false,
            candidates: self.registry.candidates(server.port),
            ident_attempts: 0,
            partial_request: None,
            partial_response: None,
            pending: PendingStore::for_mode(MatchMode::Fifo),
            created_ns: event.timestamp_ns,
            last_active_ns: event.timestamp_ns,
        };
        self.connections.insert(*key, state);
        self.metrics.connection_opened();
        debug!(%key, server = %server, "connection tracked");
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .connections
            .iter()
            .min_by_key(|(_, s)| s.last_active_ns)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            self.connections.remove(&key);
            self.metrics.eviction();
            self.metrics.connection_closed();
            debug!(%key, "connection table full, evicted least recent");
        }
    }

    /// Parse as many framed messages out of `buffer` as possible,
    /// feeding each into the matcher.
    fn decode_buffer(
        &mut self,
        key: &ConnectionKey,
        direction: MessageDirection,
        buffer: Bytes,
        base_ts: u64,
        truncated: bool,
        pairs: &mut Vec<MessagePair>,
    ) {
        let mut offset = 0;
        for _ in 0..MAX_MESSAGES_PER_EVENT {
            if offset >= buffer.len() {
                return;
            }
            let remainder = buffer.slice(offset..);

            let state = self.connections.get_mut(key).expect("state exists");
            let decoder = if state.protocol_locked {
                let decoder = self
                    .registry
                    .decoder(state.protocol)
                    .expect("locked protocol has a decoder")
                    .clone();
                Some(decoder)
            } else {
                None
            };

            let verdict = match decoder {
                Some(decoder) => {
                    let mut msg =
                        PayloadMessage::new(remainder.clone(), direction, base_ts, *key);
                    msg.truncated = truncated;
                    match decoder.parse(&mut msg) {
                        Verdict::Matched { consumed } => {
                            self.feed_matcher(key, msg, pairs);
                            Verdict::Matched { consumed }
                        }
                        other => other,
                    }
                }
                None => self.identify(key, direction, &remainder, base_ts, truncated, pairs),
            };

            match verdict {
                Verdict::Matched { consumed } if consumed > 0 => {
                    offset += consumed;
                }
                Verdict::Matched { .. } => {
                    // A zero-length consume would loop forever.
                    return;
                }
                Verdict::NeedMore => {
                    self.retain_partial(key, direction, &buffer[offset..], base_ts, truncated);
                    return;
                }
                Verdict::Reject => {
                    let state = self.connections.get_mut(key).expect("state exists");
                    if state.protocol_locked {
                        // Mid-stream bytes that do not parse (e.g. the
                        // tail of a body we chose not to track) are
                        // dropped, not fatal.
                        self.metrics.parse_reject(state.protocol);
                    }
                    return;
                }
            }
        }
    }

    /// Run the identification ladder over the candidate decoders.
    fn identify(
        &mut self,
        key: &ConnectionKey,
        direction: MessageDirection,
        data: &Bytes,
        base_ts: u64,
        truncated: bool,
        pairs: &mut Vec<MessagePair>,
    ) -> Verdict {
        let state = self.connections.get_mut(key).expect("state exists");
        state.ident_attempts += 1;
        if state.ident_attempts > self.max_ident_retries {
            debug!(%key, "identification retries exhausted, falling back to generic");
            return self.lock_generic(key, direction, data, base_ts, pairs);
        }

        let candidates = state.candidates.clone();
        let mut saw_need_more = false;
        for candidate in candidates {
            let Some(decoder) = self.registry.decoder(candidate).cloned() else {
                continue;
            };
            if decoder.fast_fail(data, direction) {
                continue;
            }
            let mut msg = PayloadMessage::new(data.clone(), direction, base_ts, *key);
            msg.truncated = truncated;
            match decoder.parse(&mut msg) {
                Verdict::Matched { consumed } => {
                    let state = self.connections.get_mut(key).expect("state exists");
                    state.protocol = candidate;
                    state.protocol_locked = true;
                    state.pending = PendingStore::for_mode(decoder.match_mode());
                    debug!(%key, protocol = %candidate, "protocol locked");
                    self.feed_matcher(key, msg, pairs);
                    return Verdict::Matched { consumed };
                }
                Verdict::NeedMore => {
                    // Buffer once for the first undecided candidate in
                    // hint order; later candidates see the same bytes
                    // again on the next attempt anyway.
                    saw_need_more = true;
                }
                Verdict::Reject => continue,
            }
        }

        if saw_need_more {
            Verdict::NeedMore
        } else {
            // Every candidate rejected outright.
            self.lock_generic(key, direction, data, base_ts, pairs)
        }
    }

    fn lock_generic(
        &mut self,
        key: &ConnectionKey,
        direction: MessageDirection,
        data: &Bytes,
        base_ts: u64,
        pairs: &mut Vec<MessagePair>,
    ) -> Verdict {
        let state = self.connections.get_mut(key).expect("state exists");
        state.protocol = Protocol::Generic;
        state.protocol_locked = true;
        state.partial_request = None;
        state.partial_response = None;
        state.pending = PendingStore::for_mode(MatchMode::Fifo);

        let decoder = self
            .registry
            .decoder(Protocol::Generic)
            .expect("generic decoder present")
            .clone();
        let mut msg = PayloadMessage::new(data.clone(), direction, base_ts, *key);
        match decoder.parse(&mut msg) {
            Verdict::Matched { consumed } => {
                self.feed_matcher(key, msg, pairs);
                Verdict::Matched { consumed }
            }
            other => other,
        }
    }

    /// Keep leftover bytes for the next event on this direction,
    /// bounded by the partial-buffer cap.
    fn retain_partial(
        &mut self,
        key: &ConnectionKey,
        direction: MessageDirection,
        data: &[u8],
        base_ts: u64,
        truncated: bool,
    ) {
        if data.len() > self.max_partial {
            self.metrics.partial_overflow();
            let state = self.connections.get_mut(key).expect("state exists");
            state.protocol = Protocol::Generic;
            state.protocol_locked = true;
            state.partial_request = None;
            state.partial_response = None;
            debug!(%key, bytes = data.len(), "partial buffer overflow, forced generic");
            return;
        }
        let state = self.connections.get_mut(key).expect("state exists");
        *state.partial_mut(direction) = Some(PartialBuffer {
            data: data.to_vec(),
            timestamp_ns: base_ts,
            truncated,
        });
    }

    /// Route one decoded message through the pending store.
    fn feed_matcher(&mut self, key: &ConnectionKey, mut msg: PayloadMessage, pairs: &mut Vec<MessagePair>) {
        if msg.control {
            return;
        }
        let state = self.connections.get_mut(key).expect("state exists");
        let protocol = state.protocol;

        match msg.direction {
            MessageDirection::Request => {
                msg.release_data();
                if state.pending.push(msg, self.max_pending).is_some() {
                    self.metrics.pending_drop();
                }
            }
            MessageDirection::Response => {
                let pair = match state.pending.take_match(&msg) {
                    Some(request) => MessagePair::complete(protocol, request, msg),
                    None => {
                        self.metrics.orphan_response();
                        MessagePair::orphan_response(protocol, msg)
                    }
                };
                pairs.push(self.attach_connection(key, pair));
            }
        }
    }

    fn attach_connection(&self, key: &ConnectionKey, mut pair: MessagePair) -> MessagePair {
        if let Some(state) = self.connections.get(key) {
            pair.server = Some(state.server);
            pair.client = Some(key.peer_of(state.server));
            pair.pid = state.pid;
        }
        pair
    }

    /// Periodic sweep: drop idle connections and flush requests that
    /// outlived the request timeout as synthetic timeout pairs.
    pub fn sweep(
        &mut self,
        now_ns: u64,
        idle_ttl: Duration,
        request_timeout: Duration,
    ) -> Vec<MessagePair> {
        let idle_cutoff = now_ns.saturating_sub(idle_ttl.as_nanos() as u64);
        let request_cutoff = now_ns.saturating_sub(request_timeout.as_nanos() as u64);
        let mut out = Vec::new();

        let idle: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|(_, s)| s.last_active_ns < idle_cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in idle {
            let mut state = self.connections.remove(&key).expect("listed above");
            self.metrics.eviction();
            self.metrics.connection_closed();
            for request in state.pending.drain_all() {
                self.metrics.timeout();
                let mut pair = MessagePair::unanswered(state.protocol, request, PairError::Timeout);
                pair.server = Some(state.server);
                pair.client = Some(key.peer_of(state.server));
                pair.pid = state.pid;
                out.push(pair);
            }
            let lifetime_ms = now_ns.saturating_sub(state.created_ns) / 1_000_000;
            debug!(%key, lifetime_ms, "idle connection evicted");
        }

        let expired: Vec<(ConnectionKey, Vec<PayloadMessage>)> = self
            .connections
            .iter_mut()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(k, s)| (*k, s.pending.drain_older_than(request_cutoff)))
            .filter(|(_, requests)| !requests.is_empty())
            .collect();
        for (key, requests) in expired {
            let protocol = self.connections[&key].protocol;
            for request in requests {
                self.metrics.timeout();
                out.push(self.attach_connection(
                    &key,
                    MessagePair::unanswered(protocol, request, PairError::Timeout),
                ));
            }
        }

        out
    }

    /// Shutdown flush: every in-flight request becomes a synthetic pair.
    pub fn drain_all(&mut self) -> Vec<MessagePair> {
        let mut out = Vec::new();
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            let mut state = self.connections.remove(&key).expect("listed above");
            self.metrics.connection_closed();
            for request in state.pending.drain_all() {
                let mut pair = MessagePair::unanswered(state.protocol, request, PairError::Shutdown);
                pair.server = Some(state.server);
                pair.client = Some(key.peer_of(state.server));
                pair.pid = state.pid;
                out.push(pair);
            }
        }
        out
    }
}
