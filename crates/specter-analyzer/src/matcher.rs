//! Request/response pairing. Connection-oriented protocols answer in
//! FIFO order; id-keyed protocols (DNS, Kafka, Dubbo, RocketMQ) pair on
//! the correlation id and may answer out of order. Both stores are
//! bounded: FIFO overflow drops the oldest request, id-keyed overflow
//! evicts in insertion order.

use std::collections::{HashMap, VecDeque};

use specter_core::message::PayloadMessage;
use specter_protocol::MatchMode;

#[derive(Debug)]
pub enum PendingStore {
    Fifo(VecDeque<PayloadMessage>),
    ById {
        by_id: HashMap<i64, PayloadMessage>,
        order: VecDeque<i64>,
    },
}

impl PendingStore {
    pub fn for_mode(mode: MatchMode) -> Self {
        match mode {
            MatchMode::Fifo => Self::Fifo(VecDeque::new()),
            MatchMode::ById => Self::ById {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Fifo(queue) => queue.len(),
            Self::ById { by_id, .. } => by_id.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park a request. When the store is at `cap` the oldest entry is
    /// dropped and returned so the caller can count it.
    pub fn push(&mut self, request: PayloadMessage, cap: usize) -> Option<PayloadMessage> {
        match self {
            Self::Fifo(queue) => {
                let dropped = if queue.len() >= cap {
                    queue.pop_front()
                } else {
                    None
                };
                queue.push_back(request);
                dropped
            }
            Self::ById { by_id, order } => {
                let id = request.correlation_id.unwrap_or(0);
                // A repeated id replaces the stale entry.
                let mut dropped = by_id.insert(id, request);
                if dropped.is_some() {
                    order.retain(|&o| o != id);
                } else if by_id.len() > cap {
                    if let Some(oldest) = order.pop_front() {
                        dropped = by_id.remove(&oldest);
                    }
                }
                order.push_back(id);
                dropped
            }
        }
    }

    /// The request this response answers, if any.
    pub fn take_match(&mut self, response: &PayloadMessage) -> Option<PayloadMessage> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::ById { by_id, order } => {
                let id = response.correlation_id?;
                let request = by_id.remove(&id)?;
                order.retain(|&o| o != id);
                Some(request)
            }
        }
    }

    /// Remove and return every request that arrived before `cutoff_ns`.
    pub fn drain_older_than(&mut self, cutoff_ns: u64) -> Vec<PayloadMessage> {
        match self {
            Self::Fifo(queue) => {
                let mut out = Vec::new();
                while queue.front().is_some_and(|m| m.timestamp_ns < cutoff_ns) {
                    out.extend(queue.pop_front());
                }
                out
            }
            Self::ById { by_id, order } => {
                let expired: Vec<i64> = order
                    .iter()
                    .copied()
                    .filter(|id| by_id.get(id).is_some_and(|m| m.timestamp_ns < cutoff_ns))
                    .collect();
                let mut out = Vec::with_capacity(expired.len());
                for id in expired {
                    order.retain(|&o| o != id);
                    out.extend(by_id.remove(&id));
                }
                out
            }
        }
    }

    pub fn drain_all(&mut self) -> Vec<PayloadMessage> {
        match self {
            Self::Fifo(queue) => queue.drain(..).collect(),
            Self::ById { by_id, order } => {
                let mut out: Vec<PayloadMessage> = Vec::with_capacity(by_id.len());
                for id in order.drain(..) {
                    out.extend(by_id.remove(&id));
                }
                out.extend(by_id.drain().map(|(_, m)| m));
                out
            }
        }
    }
}
