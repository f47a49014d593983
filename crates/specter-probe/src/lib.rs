//! Event sources for the analyzer.
//!
//! The kernel probe itself is native code living outside this
//! repository; its bridge hands events over as JSON datagrams on a Unix
//! socket. A replay source reads the same records from a JSONL file for
//! demos and offline runs.

mod replay;
mod wire;

#[cfg(target_os = "linux")]
mod uds;

use specter_core::error::ProbeError;
use specter_core::event::RawEvent;
use tokio::sync::mpsc;

pub use replay::ReplayProbe;
pub use wire::BridgeEvent;

#[cfg(target_os = "linux")]
pub use uds::UnixSocketProbe;

/// Abstraction over probe event sources.
pub trait ProbeBackend: Send {
    /// Prepare bridge resources. Must be called before `subscribe`.
    fn init(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Register interest in one event/category with the bridge.
    fn subscribe(&mut self, event_name: &str, category: &str) -> Result<(), ProbeError>;

    /// Start delivering events.
    /// Returns a receiver that yields raw syscall events.
    fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ProbeError>;

    /// Gracefully stop the source.
    fn stop(&mut self) -> Result<(), ProbeError>;

    /// Human-readable name of this source (e.g., "uds", "replay").
    fn name(&self) -> &str;
}
