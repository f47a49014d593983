//! Workload enrichment: attach Kubernetes identity from the metadata
//! snapshot to emitted pairs. Lookups are read-only snapshot reads and
//! never block the lane.

use std::sync::Arc;

use specter_core::message::{AttrValue, MessagePair};
use specter_core::metadata::MetadataRegistry;

pub const SERVER_ADDRESS: &str = "net.server.address";
pub const CLIENT_ADDRESS: &str = "net.client.address";
pub const WORKLOAD_NAME: &str = "k8s.workload.name";
pub const WORKLOAD_KIND: &str = "k8s.workload.kind";
pub const NAMESPACE: &str = "k8s.namespace.name";
pub const CONTAINER_ID: &str = "container.id";
pub const SERVICE_NAME: &str = "service.name";
pub const PEER_WORKLOAD_NAME: &str = "k8s.peer.workload.name";

pub struct Enricher {
    metadata: Arc<MetadataRegistry>,
}

impl Enricher {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self { metadata }
    }

    pub fn enrich(&self, pair: &mut MessagePair) {
        let snapshot = self.metadata.load();

        if let Some(server) = pair.server {
            pair.attributes.insert(
                SERVER_ADDRESS.to_string(),
                AttrValue::Str(server.to_string()),
            );
            if let Some(identity) = snapshot.lookup(server.ip, server.port, pair.pid) {
                pair.attributes.insert(
                    WORKLOAD_NAME.to_string(),
                    AttrValue::Str(identity.workload_name.clone()),
                );
                pair.attributes.insert(
                    WORKLOAD_KIND.to_string(),
                    AttrValue::Str(identity.workload_kind.clone()),
                );
                pair.attributes.insert(
                    NAMESPACE.to_string(),
                    AttrValue::Str(identity.namespace.clone()),
                );
                if let Some(container_id) = &identity.container_id {
                    pair.attributes.insert(
                        CONTAINER_ID.to_string(),
                        AttrValue::Str(container_id.clone()),
                    );
                }
                if let Some(service_name) = &identity.service_name {
                    pair.attributes.insert(
                        SERVICE_NAME.to_string(),
                        AttrValue::Str(service_name.clone()),
                    );
                }
            }
        }

        if let Some(client) = pair.client {
            pair.attributes.insert(
                CLIENT_ADDRESS.to_string(),
                AttrValue::Str(client.to_string()),
            );
            if let Some(identity) = snapshot.lookup(client.ip, client.port, 0) {
                pair.attributes.insert(
                    PEER_WORKLOAD_NAME.to_string(),
                    AttrValue::Str(identity.workload_name.clone()),
                );
            }
        }
    }
}
