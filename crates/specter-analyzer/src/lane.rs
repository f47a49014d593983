//! One worker lane: a single task owning a shard of the connection
//! table. Events arrive on a bounded per-lane queue, the eviction timer
//! ticks inside the same loop, and shutdown drains with a deadline
//! before flushing in-flight requests.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use specter_core::config::DropPolicy;
use specter_core::event::RawEvent;
use specter_core::message::MessagePair;
use specter_core::metrics::AnalyzerMetrics;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::enrich::Enricher;
use crate::tracker::ConnectionTable;

pub(crate) fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Lane input, shaped by the drop policy: `drop_newest` is a plain
/// bounded mpsc whose `try_send` sheds the incoming event; `drop_oldest`
/// is a broadcast ring where a lagging lane loses the oldest entries
/// (counted from the `Lagged` error).
pub(crate) fn lane_channel(policy: DropPolicy, depth: usize) -> (LaneSender, LaneReceiver) {
    match policy {
        DropPolicy::DropNewest => {
            let (tx, rx) = mpsc::channel(depth);
            (LaneSender::Newest(tx), LaneReceiver::Newest(rx))
        }
        DropPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(depth);
            (LaneSender::Oldest(tx), LaneReceiver::Oldest(rx))
        }
    }
}

pub(crate) enum LaneSender {
    Newest(mpsc::Sender<RawEvent>),
    Oldest(broadcast::Sender<RawEvent>),
}

impl LaneSender {
    /// Returns `false` when the event was shed.
    pub(crate) fn send(&self, event: RawEvent) -> bool {
        match self {
            Self::Newest(tx) => tx.try_send(event).is_ok(),
            Self::Oldest(tx) => tx.send(event).is_ok(),
        }
    }
}

pub(crate) enum LaneReceiver {
    Newest(mpsc::Receiver<RawEvent>),
    Oldest(broadcast::Receiver<RawEvent>),
}

impl LaneReceiver {
    async fn recv(&mut self, metrics: &AnalyzerMetrics) -> Option<RawEvent> {
        match self {
            Self::Newest(rx) => rx.recv().await,
            Self::Oldest(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        metrics.events_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    fn try_recv(&mut self, metrics: &AnalyzerMetrics) -> Option<RawEvent> {
        match self {
            Self::Newest(rx) => rx.try_recv().ok(),
            Self::Oldest(rx) => loop {
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        metrics.events_dropped(n);
                    }
                    Err(_) => return None,
                }
            },
        }
    }
}

pub(crate) struct Lane {
    pub table: ConnectionTable,
    pub rx: LaneReceiver,
    pub out: mpsc::Sender<MessagePair>,
    pub enricher: Enricher,
    pub metrics: AnalyzerMetrics,
    pub idle_ttl: Duration,
    pub request_timeout: Duration,
    pub eviction_interval: Duration,
    pub drain_timeout: Duration,
}

impl Lane {
    pub(crate) async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let Lane {
            mut table,
            mut rx,
            out,
            enricher,
            metrics,
            idle_ttl,
            request_timeout,
            eviction_interval,
            drain_timeout,
        } = self;

        let mut tick = tokio::time::interval(eviction_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    let pairs = table.sweep(unix_nanos(), idle_ttl, request_timeout);
                    if emit(&out, &enricher, &metrics, pairs).await.is_err() {
                        return;
                    }
                }
                event = rx.recv(&metrics) => match event {
                    Some(event) => {
                        let pairs = table.handle_event(&event);
                        if emit(&out, &enricher, &metrics, pairs).await.is_err() {
                            return;
                        }
                    }
                    // Event source is gone; fall through to the flush.
                    None => break,
                }
            }
        }

        // Drain whatever is still queued, bounded by the deadline.
        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline {
            let Some(event) = rx.try_recv(&metrics) else {
                break;
            };
            let pairs = table.handle_event(&event);
            if emit(&out, &enricher, &metrics, pairs).await.is_err() {
                return;
            }
        }

        // Unanswered requests leave as synthetic shutdown pairs.
        let pairs = table.drain_all();
        let flushed = pairs.len();
        let _ = emit(&out, &enricher, &metrics, pairs).await;
        debug!(flushed, "lane stopped");
    }
}

/// Enrich and forward pairs; `Err` means the consumer went away.
async fn emit(
    out: &mpsc::Sender<MessagePair>,
    enricher: &Enricher,
    metrics: &AnalyzerMetrics,
    pairs: Vec<MessagePair>,
) -> Result<(), ()> {
    for mut pair in pairs {
        enricher.enrich(&mut pair);
        metrics.pair_emitted();
        if out.send(pair).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}
