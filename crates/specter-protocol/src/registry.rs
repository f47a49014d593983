use std::collections::HashMap;
use std::sync::Arc;

use specter_core::message::Protocol;

use crate::decoder::ProtocolDecoder;
use crate::dns::DnsDecoder;
use crate::dubbo::DubboDecoder;
use crate::generic::GenericDecoder;
use crate::http::HttpDecoder;
use crate::kafka::KafkaDecoder;
use crate::mysql::MysqlDecoder;
use crate::redis::RedisDecoder;
use crate::rocketmq::RocketmqDecoder;

/// Identification order when the server port gives no hint. Cheap,
/// high-confidence fast-fails first.
pub const DEFAULT_CANDIDATE_ORDER: [Protocol; 7] = [
    Protocol::Http,
    Protocol::Redis,
    Protocol::Dns,
    Protocol::Mysql,
    Protocol::Dubbo,
    Protocol::Kafka,
    Protocol::Rocketmq,
];

/// Decoder instances plus the port → candidate mapping used for
/// identification. One registry is shared by every lane.
pub struct DecoderRegistry {
    decoders: HashMap<Protocol, Arc<dyn ProtocolDecoder>>,
    port_map: HashMap<u16, Vec<Protocol>>,
}

impl DecoderRegistry {
    pub fn new(port_map: HashMap<u16, Vec<Protocol>>) -> Self {
        let decoders: [Arc<dyn ProtocolDecoder>; 8] = [
            Arc::new(HttpDecoder),
            Arc::new(MysqlDecoder),
            Arc::new(RedisDecoder),
            Arc::new(DnsDecoder),
            Arc::new(KafkaDecoder),
            Arc::new(DubboDecoder),
            Arc::new(RocketmqDecoder),
            Arc::new(GenericDecoder),
        ];
        Self {
            decoders: decoders.into_iter().map(|d| (d.protocol(), d)).collect(),
            port_map,
        }
    }

    pub fn decoder(&self, protocol: Protocol) -> Option<&Arc<dyn ProtocolDecoder>> {
        self.decoders.get(&protocol)
    }

    /// Whether this port carries a protocol hint.
    pub fn is_hinted_port(&self, port: u16) -> bool {
        self.port_map.contains_key(&port)
    }

    /// Identification candidates for a server port: the hinted
    /// protocols first, then the rest of the default order.
    pub fn candidates(&self, server_port: u16) -> Vec<Protocol> {
        let mut out = Vec::with_capacity(DEFAULT_CANDIDATE_ORDER.len());
        if let Some(hinted) = self.port_map.get(&server_port) {
            out.extend(hinted.iter().copied());
        }
        for protocol in DEFAULT_CANDIDATE_ORDER {
            if !out.contains(&protocol) {
                out.push(protocol);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use specter_core::config::default_port_map;

    use super::*;

    #[test]
    fn test_hinted_port_comes_first() {
        let registry = DecoderRegistry::new(default_port_map());
        let candidates = registry.candidates(3306);
        assert_eq!(candidates[0], Protocol::Mysql);
        // The rest of the default order follows, without duplicates.
        assert_eq!(
            candidates.iter().filter(|&&p| p == Protocol::Mysql).count(),
            1
        );
        assert!(candidates.contains(&Protocol::Http));
    }

    #[test]
    fn test_unmapped_port_gets_default_order() {
        let registry = DecoderRegistry::new(default_port_map());
        assert_eq!(registry.candidates(4242), DEFAULT_CANDIDATE_ORDER.to_vec());
        assert!(!registry.is_hinted_port(4242));
        assert!(registry.is_hinted_port(53));
    }

    #[test]
    fn test_every_protocol_has_a_decoder() {
        let registry = DecoderRegistry::new(default_port_map());
        for protocol in DEFAULT_CANDIDATE_ORDER {
            assert!(registry.decoder(protocol).is_some(), "{protocol}");
        }
        assert!(registry.decoder(Protocol::Generic).is_some());
        assert!(registry.decoder(Protocol::Unknown).is_none());
    }
}
