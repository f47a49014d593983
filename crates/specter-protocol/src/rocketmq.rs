//! RocketMQ remoting protocol: a 4-byte total length, a header-length
//! word whose high byte selects the header serialization (0 = JSON,
//! 1 = ROCKETMQ binary), the header, then the body. The decoder pulls
//! the command code, the opaque correlation id and the topic.

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{MatchMode, ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const CODE: &str = "rocketmq.code";
pub const OPAQUE: &str = "rocketmq.opaque";
pub const TOPIC: &str = "rocketmq.topic";
pub const REMARK: &str = "rocketmq.remark";

const MAX_FRAME: usize = 16 * 1024 * 1024;

const SERIALIZE_JSON: u8 = 0;
const SERIALIZE_ROCKETMQ: u8 = 1;

struct Header {
    code: i64,
    opaque: i64,
    topic: Option<String>,
    remark: Option<String>,
}

fn parse_json_header(header: &[u8]) -> Option<Header> {
    let value: serde_json::Value = serde_json::from_slice(header).ok()?;
    let code = value.get("code")?.as_i64()?;
    let opaque = value.get("opaque")?.as_i64()?;
    let topic = value
        .get("extFields")
        .and_then(|ext| ext.get("topic"))
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let remark = value
        .get("remark")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    Some(Header {
        code,
        opaque,
        topic,
        remark,
    })
}

fn parse_binary_header(header: &[u8]) -> Option<Header> {
    let mut r = ByteReader::new(header);
    let code = r.read_i16_be()? as i64;
    r.read_u8()?; // language
    r.read_u16_be()?; // version
    let opaque = r.read_i32_be()? as i64;
    r.read_i32_be()?; // flag
    let remark_len = r.read_i32_be()?;
    let remark = if remark_len > 0 {
        let bytes = r.read_bytes(remark_len as usize)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    } else {
        None
    };

    // extFields: total byte length, then length-prefixed key/value
    // pairs (i16 key, i32 value).
    let mut topic = None;
    let ext_len = r.read_i32_be().unwrap_or(0);
    if ext_len > 0 {
        let mut ext = ByteReader::new(r.read_bytes(ext_len as usize)?);
        while !ext.is_empty() {
            let Some(key) = ext.read_length_prefixed(2) else {
                break;
            };
            let Some(value) = ext.read_length_prefixed(4) else {
                break;
            };
            if key == b"topic" {
                topic = Some(String::from_utf8_lossy(value).into_owned());
                break;
            }
        }
    }

    Some(Header {
        code,
        opaque,
        topic,
        remark,
    })
}

pub struct RocketmqDecoder;

impl ProtocolDecoder for RocketmqDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Rocketmq
    }

    fn match_mode(&self) -> MatchMode {
        MatchMode::ById
    }

    fn fast_fail(&self, data: &[u8], _direction: MessageDirection) -> bool {
        if data.len() < 8 {
            return true;
        }
        let total_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let serialize_type = data[4];
        let header_len =
            u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;
        total_len < 4 + header_len
            || total_len > MAX_FRAME
            || header_len == 0
            || !matches!(serialize_type, SERIALIZE_JSON | SERIALIZE_ROCKETMQ)
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        let mut r = ByteReader::new(&data);
        let (Some(total_len), Some(header_word)) = (r.read_u32_be(), r.read_u32_be()) else {
            return Verdict::NeedMore;
        };
        let total_len = total_len as usize;
        let serialize_type = (header_word >> 24) as u8;
        let header_len = (header_word & 0x00ff_ffff) as usize;

        if total_len > MAX_FRAME || total_len < 4 + header_len || header_len == 0 {
            return Verdict::Reject;
        }
        // total_len counts the header-length word, the header and the body.
        if data.len() < 4 + total_len {
            return Verdict::NeedMore;
        }
        let Some(header_bytes) = r.read_bytes(header_len) else {
            return Verdict::NeedMore;
        };

        let header = match serialize_type {
            SERIALIZE_JSON => parse_json_header(header_bytes),
            SERIALIZE_ROCKETMQ => parse_binary_header(header_bytes),
            _ => None,
        };
        let Some(header) = header else {
            return Verdict::Reject;
        };

        msg.put_int(CODE, header.code);
        msg.put_int(OPAQUE, header.opaque);
        msg.correlation_id = Some(header.opaque);
        if let Some(topic) = header.topic {
            msg.put_str(TOPIC, topic);
        }
        if let Some(remark) = header.remark {
            msg.put_str(REMARK, remark);
        }
        if msg.direction == MessageDirection::Response {
            // Response code 0 is SUCCESS.
            msg.is_error = header.code != 0;
        }

        Verdict::Matched {
            consumed: 4 + total_len,
        }
    }
}
