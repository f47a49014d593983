//! Application-protocol decoders for the specter analyzer.
//!
//! Each decoder turns a reassembled per-direction byte stream into
//! attribute maps on payload messages: a cheap `fast_fail` pre-check,
//! then a `parse` that either consumes one framed message, rejects the
//! protocol outright, or asks for more bytes.

pub mod decoder;
pub mod dns;
pub mod dubbo;
pub mod generic;
pub mod http;
pub mod kafka;
pub mod mysql;
pub mod reader;
pub mod redis;
pub mod registry;
pub mod rocketmq;

pub use decoder::{MatchMode, ProtocolDecoder, Verdict};
pub use reader::ByteReader;
pub use registry::DecoderRegistry;
