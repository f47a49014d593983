//! Unix-socket probe source — Linux only.
//!
//! Listens on a Unix datagram socket for JSON records emitted by the
//! native eBPF bridge and converts them into [`RawEvent`]s. One
//! datagram carries one event; oversized or damaged datagrams are
//! dropped with a warning, never propagated as errors.

use std::path::{Path, PathBuf};

use specter_core::error::ProbeError;
use specter_core::event::RawEvent;
use tokio::net::UnixDatagram;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::wire::BridgeEvent;
use crate::ProbeBackend;

pub struct UnixSocketProbe {
    socket_path: PathBuf,
    subscriptions: Vec<(String, String)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl UnixSocketProbe {
    /// Create a source that will bind `socket_path`. Pass the same path
    /// to the native bridge so it knows where to send.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            subscriptions: Vec::new(),
            shutdown_tx: None,
            task_handle: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl ProbeBackend for UnixSocketProbe {
    fn subscribe(&mut self, event_name: &str, category: &str) -> Result<(), ProbeError> {
        if self.task_handle.is_some() {
            return Err(ProbeError::Subscribe {
                event: event_name.to_string(),
                category: category.to_string(),
                reason: "source already started".to_string(),
            });
        }
        debug!(event_name, category, "subscription recorded");
        self.subscriptions
            .push((event_name.to_string(), category.to_string()));
        Ok(())
    }

    fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ProbeError> {
        // Remove stale socket file if it exists.
        let _ = std::fs::remove_file(&self.socket_path);

        let socket = UnixDatagram::bind(&self.socket_path)
            .map_err(|e| ProbeError::StartFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<RawEvent>(4096);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, _from)) => {
                                dispatch_bridge_record(&buf[..n], &event_tx);
                            }
                            Err(e) => {
                                warn!("probe socket recv error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.task_handle = Some(task_handle);
        Ok(event_rx)
    }

    fn stop(&mut self) -> Result<(), ProbeError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    fn name(&self) -> &str {
        "uds"
    }
}

fn dispatch_bridge_record(data: &[u8], event_tx: &mpsc::Sender<RawEvent>) {
    let bridge = match serde_json::from_slice::<BridgeEvent>(data) {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!("probe: failed to parse bridge record: {e}");
            return;
        }
    };
    let Some(event) = bridge.into_event() else {
        warn!("probe: bridge record with damaged payload encoding");
        return;
    };
    if event_tx.try_send(event).is_err() {
        warn!("probe event channel full, dropping");
    }
}
