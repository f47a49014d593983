//! Replay source: reads bridge records from a JSONL file, one record
//! per line. Used for demos and offline analysis of captured traffic.

use std::path::PathBuf;

use specter_core::error::ProbeError;
use specter_core::event::RawEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::wire::BridgeEvent;
use crate::ProbeBackend;

pub struct ReplayProbe {
    path: PathBuf,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ReplayProbe {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            task_handle: None,
        }
    }
}

impl ProbeBackend for ReplayProbe {
    fn subscribe(&mut self, event_name: &str, category: &str) -> Result<(), ProbeError> {
        // A recording already fixes what was captured.
        info!(event_name, category, "replay source ignores subscriptions");
        Ok(())
    }

    fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ProbeError> {
        let path = self.path.clone();
        let (event_tx, event_rx) = mpsc::channel::<RawEvent>(4096);

        let task_handle = tokio::spawn(async move {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), "replay: cannot open file: {e}");
                    return;
                }
            };
            let mut lines = BufReader::new(file).lines();
            let mut replayed = 0u64;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let bridge = match serde_json::from_str::<BridgeEvent>(&line) {
                    Ok(bridge) => bridge,
                    Err(e) => {
                        warn!("replay: skipping bad record: {e}");
                        continue;
                    }
                };
                let Some(event) = bridge.into_event() else {
                    warn!("replay: skipping record with damaged payload encoding");
                    continue;
                };
                // Backpressure instead of dropping: a replay has no
                // liveness requirement.
                if event_tx.send(event).await.is_err() {
                    break;
                }
                replayed += 1;
            }
            info!(replayed, "replay finished");
        });

        self.task_handle = Some(task_handle);
        Ok(event_rx)
    }

    fn stop(&mut self) -> Result<(), ProbeError> {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[tokio::test]
    async fn test_replays_jsonl_records_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (ts, b64) in [(1u64, "YQ=="), (2, "Yg==")] {
            writeln!(
                file,
                r#"{{"timestamp_ns":{ts},"pid":1,"direction":"ingress","src_ip":"10.0.0.1","src_port":1000,"dst_ip":"10.0.0.2","dst_port":80,"syscall":"read","payload_b64":"{b64}"}}"#
            )
            .unwrap();
        }
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let mut probe = ReplayProbe::new(file.path().to_path_buf());
        probe.subscribe("syscall", "net").unwrap();
        let mut rx = probe.start().unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.timestamp_ns, 1);
        assert_eq!(&first.payload[..], b"a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.timestamp_ns, 2);
        assert_eq!(&second.payload[..], b"b");
        // The bad line was skipped and the stream ends.
        assert!(rx.recv().await.is_none());

        probe.stop().unwrap();
    }
}
