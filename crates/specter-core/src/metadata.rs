use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Workload identity
// ─────────────────────────────────────────────────────────────────────────────

/// Kubernetes workload identity attached to emitted pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub workload_name: String,
    pub workload_kind: String,
    pub namespace: String,
    pub container_id: Option<String>,
    pub service_name: Option<String>,
}

/// One immutable view of the cluster metadata, built by the watcher.
///
/// Lookups fall through pid → ip:port → ip, most specific first.
#[derive(Debug, Default, Clone)]
pub struct MetadataSnapshot {
    by_pid: HashMap<u32, WorkloadIdentity>,
    by_endpoint: HashMap<(IpAddr, u16), WorkloadIdentity>,
    by_ip: HashMap<IpAddr, WorkloadIdentity>,
}

impl MetadataSnapshot {
    pub fn insert_pid(&mut self, pid: u32, identity: WorkloadIdentity) {
        self.by_pid.insert(pid, identity);
    }

    pub fn insert_endpoint(&mut self, ip: IpAddr, port: u16, identity: WorkloadIdentity) {
        self.by_endpoint.insert((ip, port), identity);
    }

    pub fn insert_ip(&mut self, ip: IpAddr, identity: WorkloadIdentity) {
        self.by_ip.insert(ip, identity);
    }

    pub fn lookup(&self, ip: IpAddr, port: u16, pid: u32) -> Option<&WorkloadIdentity> {
        self.by_pid
            .get(&pid)
            .or_else(|| self.by_endpoint.get(&(ip, port)))
            .or_else(|| self.by_ip.get(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty() && self.by_endpoint.is_empty() && self.by_ip.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry — snapshot holder
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide holder for the current [`MetadataSnapshot`].
///
/// The watcher replaces the whole snapshot with [`swap`][Self::swap];
/// workers grab an `Arc` with [`load`][Self::load] and read it without
/// further synchronization. A worker may briefly observe the previous
/// snapshot after a swap, which is fine — the metadata is advisory.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    current: RwLock<Arc<MetadataSnapshot>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn swap(&self, snapshot: MetadataSnapshot) {
        let mut guard = self.current.write().expect("metadata lock poisoned");
        *guard = Arc::new(snapshot);
    }

    pub fn load(&self) -> Arc<MetadataSnapshot> {
        self.current
            .read()
            .expect("metadata lock poisoned")
            .clone()
    }

    pub fn lookup(&self, ip: IpAddr, port: u16, pid: u32) -> Option<WorkloadIdentity> {
        self.load().lookup(ip, port, pid).cloned()
    }
}
