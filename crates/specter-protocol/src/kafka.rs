//! Kafka wire protocol. Requests are classified by api key with topic
//! extraction for Produce, Fetch and Metadata; responses only surface
//! the correlation id, which is what the matcher pairs on.
//!
//! Flexible versions (Produce >= v9, Fetch >= v12, Metadata >= v9) use
//! compact encodings; for those only the api name and correlation id
//! are recorded.

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{MatchMode, ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const API: &str = "kafka.api";
pub const API_VERSION: &str = "kafka.api_version";
pub const CORRELATION_ID: &str = "kafka.correlation_id";
pub const TOPIC: &str = "kafka.topic";
pub const CLIENT_ID: &str = "kafka.client_id";

const MAX_FRAME: usize = 16 * 1024 * 1024;
const MAX_API_KEY: i16 = 67;
const MAX_API_VERSION: i16 = 20;

const API_PRODUCE: i16 = 0;
const API_FETCH: i16 = 1;
const API_METADATA: i16 = 3;

fn api_name(key: i16) -> Option<&'static str> {
    match key {
        API_PRODUCE => Some("produce"),
        API_FETCH => Some("fetch"),
        2 => Some("list_offsets"),
        API_METADATA => Some("metadata"),
        8 => Some("offset_commit"),
        9 => Some("offset_fetch"),
        10 => Some("find_coordinator"),
        11 => Some("join_group"),
        12 => Some("heartbeat"),
        14 => Some("sync_group"),
        18 => Some("api_versions"),
        19 => Some("create_topics"),
        _ => None,
    }
}

/// Nullable Kafka string: i16 length, -1 for null.
fn read_string<'a>(r: &mut ByteReader<'a>) -> Option<Option<&'a [u8]>> {
    let len = r.read_i16_be()?;
    if len < 0 {
        return Some(None);
    }
    r.read_bytes(len as usize).map(Some)
}

pub struct KafkaDecoder;

impl ProtocolDecoder for KafkaDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Kafka
    }

    fn match_mode(&self) -> MatchMode {
        MatchMode::ById
    }

    fn fast_fail(&self, data: &[u8], direction: MessageDirection) -> bool {
        if data.len() < 8 {
            return true;
        }
        let frame_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if frame_len < 4 || frame_len > MAX_FRAME {
            return true;
        }
        match direction {
            MessageDirection::Request => {
                let api_key = i16::from_be_bytes([data[4], data[5]]);
                let api_version = i16::from_be_bytes([data[6], data[7]]);
                !(0..=MAX_API_KEY).contains(&api_key)
                    || !(0..=MAX_API_VERSION).contains(&api_version)
            }
            MessageDirection::Response => false,
        }
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        let mut r = ByteReader::new(&data);
        let Some(frame_len) = r.read_u32_be() else {
            return Verdict::NeedMore;
        };
        let frame_len = frame_len as usize;
        if frame_len < 4 || frame_len > MAX_FRAME {
            return Verdict::Reject;
        }
        let Some(frame) = r.read_bytes(frame_len) else {
            return Verdict::NeedMore;
        };
        let consumed = 4 + frame_len;

        let mut f = ByteReader::new(frame);
        match msg.direction {
            MessageDirection::Request => {
                let (Some(api_key), Some(api_version), Some(correlation_id)) =
                    (f.read_i16_be(), f.read_i16_be(), f.read_i32_be())
                else {
                    return Verdict::Reject;
                };
                if !(0..=MAX_API_KEY).contains(&api_key)
                    || !(0..=MAX_API_VERSION).contains(&api_version)
                {
                    return Verdict::Reject;
                }
                let client_id = match read_string(&mut f) {
                    Some(Some(id)) if !id.is_empty() => Some(String::from_utf8_lossy(id)),
                    Some(_) => None,
                    None => return Verdict::Reject,
                };

                let name = api_name(api_key)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("api_{api_key}"));
                msg.put_str(API, name);
                msg.put_int(API_VERSION, api_version as i64);
                msg.put_int(CORRELATION_ID, correlation_id as i64);
                msg.correlation_id = Some(correlation_id as i64);
                if let Some(id) = client_id {
                    msg.put_str(CLIENT_ID, id);
                }

                if let Some(topic) = extract_topic(&mut f, api_key, api_version) {
                    msg.put_str(TOPIC, topic);
                }
            }
            MessageDirection::Response => {
                let Some(correlation_id) = f.read_i32_be() else {
                    return Verdict::Reject;
                };
                msg.put_int(CORRELATION_ID, correlation_id as i64);
                msg.correlation_id = Some(correlation_id as i64);
            }
        }

        Verdict::Matched { consumed }
    }
}

/// First topic name of a Produce/Fetch/Metadata request body, for the
/// non-flexible protocol versions.
fn extract_topic(f: &mut ByteReader<'_>, api_key: i16, api_version: i16) -> Option<String> {
    match (api_key, api_version) {
        (API_PRODUCE, 0..=8) => {
            if api_version >= 3 {
                read_string(f)?; // transactional_id
            }
            f.read_i16_be()?; // acks
            f.read_i32_be()?; // timeout_ms
            read_topic_array(f)
        }
        (API_FETCH, 0..=11) => {
            f.read_i32_be()?; // replica_id
            f.read_i32_be()?; // max_wait_ms
            f.read_i32_be()?; // min_bytes
            if api_version >= 3 {
                f.read_i32_be()?; // max_bytes
            }
            if api_version >= 4 {
                f.read_u8()?; // isolation_level
            }
            if api_version >= 7 {
                f.read_i32_be()?; // session_id
                f.read_i32_be()?; // session_epoch
            }
            read_topic_array(f)
        }
        (API_METADATA, 0..=8) => read_topic_array(f),
        _ => None,
    }
}

fn read_topic_array(f: &mut ByteReader<'_>) -> Option<String> {
    let count = f.read_i32_be()?;
    if count < 1 || count > 10_000 {
        return None;
    }
    read_string(f)?
        .filter(|t| !t.is_empty())
        .map(|t| String::from_utf8_lossy(t).into_owned())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use specter_core::event::{Endpoint, FiveTuple, Transport};

    use super::*;

    fn msg(data: &[u8], direction: MessageDirection) -> PayloadMessage {
        let key = FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 9092),
            transport: Transport::Tcp,
        }
        .key();
        PayloadMessage::new(Bytes::copy_from_slice(data), direction, 0, key)
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn kafka_string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as i16).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn request_header(api_key: i16, api_version: i16, correlation_id: i32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&api_key.to_be_bytes());
        out.extend_from_slice(&api_version.to_be_bytes());
        out.extend_from_slice(&correlation_id.to_be_bytes());
        out.extend(kafka_string("producer-1"));
        out
    }

    #[test]
    fn test_produce_v3_topic() {
        let mut body = request_header(0, 3, 7);
        body.extend_from_slice(&(-1i16).to_be_bytes()); // transactional_id null
        body.extend_from_slice(&1i16.to_be_bytes()); // acks
        body.extend_from_slice(&30_000i32.to_be_bytes()); // timeout
        body.extend_from_slice(&1i32.to_be_bytes()); // topic count
        body.extend(kafka_string("orders"));
        let raw = framed(&body);

        let mut m = msg(&raw, MessageDirection::Request);
        assert_eq!(
            KafkaDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.str_attr(API), Some("produce"));
        assert_eq!(m.str_attr(TOPIC), Some("orders"));
        assert_eq!(m.str_attr(CLIENT_ID), Some("producer-1"));
        assert_eq!(m.correlation_id, Some(7));
    }

    #[test]
    fn test_fetch_v4_topic() {
        let mut body = request_header(1, 4, 21);
        body.extend_from_slice(&(-1i32).to_be_bytes()); // replica_id
        body.extend_from_slice(&500i32.to_be_bytes()); // max_wait
        body.extend_from_slice(&1i32.to_be_bytes()); // min_bytes
        body.extend_from_slice(&1_048_576i32.to_be_bytes()); // max_bytes
        body.push(0); // isolation_level
        body.extend_from_slice(&1i32.to_be_bytes()); // topic count
        body.extend(kafka_string("events"));
        let raw = framed(&body);

        let mut m = msg(&raw, MessageDirection::Request);
        assert!(matches!(KafkaDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.str_attr(API), Some("fetch"));
        assert_eq!(m.str_attr(TOPIC), Some("events"));
    }

    #[test]
    fn test_response_correlation_only() {
        let mut body = 21i32.to_be_bytes().to_vec();
        body.extend_from_slice(&[0; 16]); // opaque response body
        let raw = framed(&body);

        let mut m = msg(&raw, MessageDirection::Response);
        assert!(matches!(KafkaDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.correlation_id, Some(21));
    }

    #[test]
    fn test_split_frame_needs_more() {
        let body = request_header(3, 1, 2);
        let raw = framed(&body);
        let mut m = msg(&raw[..10], MessageDirection::Request);
        assert_eq!(KafkaDecoder.parse(&mut m), Verdict::NeedMore);
    }

    #[test]
    fn test_fast_fail_on_bad_api() {
        let mut body = request_header(99, 1, 2);
        body.truncate(8);
        let raw = framed(&body);
        assert!(KafkaDecoder.fast_fail(&raw, MessageDirection::Request));
        assert!(KafkaDecoder.fast_fail(b"GET / HT", MessageDirection::Request));
    }

    #[test]
    fn test_flexible_version_records_api_only() {
        let mut body = request_header(0, 9, 5);
        body.extend_from_slice(&[0x00, 0x01, 0x02]); // compact-encoded tail
        let raw = framed(&body);

        let mut m = msg(&raw, MessageDirection::Request);
        assert!(matches!(KafkaDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.str_attr(API), Some("produce"));
        assert!(m.str_attr(TOPIC).is_none());
    }
}
