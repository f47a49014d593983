//! The specter analyzer: turns the probe's raw syscall events into
//! matched, attributed request/response pairs.
//!
//! Events are routed to worker lanes by a stable hash of the connection
//! key, so every event of a connection is handled by exactly one lane
//! and no per-connection locks exist. Lanes run identification,
//! stream reassembly, decoding, matching and eviction; completed pairs
//! are enriched with workload identity and fan into one output channel.

pub mod enrich;
pub mod matcher;
mod lane;
mod tracker;

use std::sync::Arc;

use specter_core::config::AnalyzerConfig;
use specter_core::event::RawEvent;
use specter_core::message::MessagePair;
use specter_core::metadata::MetadataRegistry;
use specter_core::metrics::AnalyzerMetrics;
use specter_protocol::DecoderRegistry;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

pub use enrich::Enricher;
pub use tracker::ConnectionTable;

use crate::lane::{Lane, lane_channel};

/// Size of the shared pair output channel.
const OUTPUT_DEPTH: usize = 4096;

/// Handle to a running analyzer pipeline.
pub struct Analyzer {
    lane_shutdowns: Vec<oneshot::Sender<()>>,
    lane_handles: Vec<JoinHandle<()>>,
    router_handle: JoinHandle<()>,
}

impl Analyzer {
    /// Spawn the router and worker lanes. Returns the handle and the
    /// channel on which matched pairs are delivered.
    pub fn start(
        config: &AnalyzerConfig,
        registry: Arc<DecoderRegistry>,
        metadata: Arc<MetadataRegistry>,
        metrics: AnalyzerMetrics,
        mut events: mpsc::Receiver<RawEvent>,
    ) -> (Self, mpsc::Receiver<MessagePair>) {
        let workers = config.effective_workers();
        let per_lane_capacity = (config.max_connections / workers).max(1);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_DEPTH);

        let mut senders = Vec::with_capacity(workers);
        let mut lane_shutdowns = Vec::with_capacity(workers);
        let mut lane_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = lane_channel(config.drop_policy, config.lane_queue_depth);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let lane = Lane {
                table: ConnectionTable::new(
                    config,
                    per_lane_capacity,
                    registry.clone(),
                    metrics.clone(),
                ),
                rx,
                out: out_tx.clone(),
                enricher: Enricher::new(metadata.clone()),
                metrics: metrics.clone(),
                idle_ttl: config.connection_idle_ttl,
                request_timeout: config.request_timeout,
                eviction_interval: config.eviction_interval,
                drain_timeout: config.drain_timeout,
            };
            senders.push(tx);
            lane_shutdowns.push(shutdown_tx);
            lane_handles.push(tokio::spawn(lane.run(shutdown_rx)));
        }
        drop(out_tx);
        info!(workers, per_lane_capacity, "analyzer started");

        let router_metrics = metrics;
        let router_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router_metrics.event_in();
                let lane = (event.tuple.key().lane_hash() % senders.len() as u64) as usize;
                if !senders[lane].send(event) {
                    router_metrics.events_dropped(1);
                }
            }
            // Dropping the senders lets the lanes drain and flush.
        });

        (
            Self {
                lane_shutdowns,
                lane_handles,
                router_handle,
            },
            out_rx,
        )
    }

    /// Signal every lane, wait for their drain/flush, and tear down the
    /// router.
    pub async fn stop(mut self) {
        for shutdown in self.lane_shutdowns.drain(..) {
            let _ = shutdown.send(());
        }
        for handle in self.lane_handles.drain(..) {
            let _ = handle.await;
        }
        self.router_handle.abort();
        let _ = self.router_handle.await;
        info!("analyzer stopped");
    }
}
