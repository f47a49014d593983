//! Dubbo RPC framing: 16-byte header (magic, flags, status, request id,
//! body length) followed by a serialized body. Service and method names
//! are pulled out of Hessian2 and Fastjson bodies; other serializations
//! still yield header-level attributes. Matching is by request id.

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{MatchMode, ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const SERVICE: &str = "dubbo.service";
pub const METHOD: &str = "dubbo.method";
pub const REQUEST_ID: &str = "dubbo.request_id";
pub const ERROR_CODE: &str = "dubbo.error_code";
pub const EVENT: &str = "dubbo.event";

const MAGIC: [u8; 2] = [0xda, 0xbb];
const HEADER_LEN: usize = 16;
const MAX_BODY: usize = 16 * 1024 * 1024;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_EVENT: u8 = 0x20;
const SERIAL_MASK: u8 = 0x1f;

const SERIAL_HESSIAN2: u8 = 0x02;
const SERIAL_FASTJSON: u8 = 0x06;

const STATUS_OK: u8 = 20;

/// Hessian2 string reading, limited to what request bodies need.
///
/// Tag bytes `0x30..=0x33` carry a two-byte length
/// (`((t - 0x30) << 8) | next`); any other tag byte is itself the
/// length. Reads that would run out of bounds yield an empty string at
/// the end of the buffer.
pub(crate) mod hessian2 {
    fn string_bounds(data: &[u8], offset: usize) -> Option<(usize, usize)> {
        let tag = *data.get(offset)? as usize;
        let (len, start) = if (0x30..=0x33).contains(&tag) {
            let next = *data.get(offset + 1)? as usize;
            ((tag - 0x30) << 8 | next, offset + 2)
        } else {
            (tag, offset + 1)
        };
        if start + len > data.len() {
            return None;
        }
        Some((start, start + len))
    }

    pub fn eat_string(data: &[u8], offset: usize) -> usize {
        match string_bounds(data, offset) {
            Some((_, end)) => end,
            None => data.len(),
        }
    }

    pub fn get_string_value(data: &[u8], offset: usize) -> (usize, String) {
        match string_bounds(data, offset) {
            Some((start, end)) => (end, String::from_utf8_lossy(&data[start..end]).into_owned()),
            None => (data.len(), String::new()),
        }
    }

    /// Scan forward from `from` for `key` and return the string value
    /// that follows it.
    pub fn get_string_value_by_key(data: &[u8], from: usize, key: &str) -> Option<String> {
        let at = memchr::memmem::find(&data[from.min(data.len())..], key.as_bytes())?;
        let after = from + at + key.len();
        let (_, value) = get_string_value(data, after);
        if value.is_empty() { None } else { Some(value) }
    }
}

/// Fastjson bodies are line-delimited JSON fragments; every string sits
/// between a pair of `"` quotes and fields are separated by `\n`.
///
/// The scan does not handle escaped quotes inside values; embedded
/// `\"` splits the field early. Reads stay in bounds regardless.
pub(crate) mod fastjson {
    use memchr::memchr;

    fn string_bounds(data: &[u8], offset: usize) -> Option<(usize, usize)> {
        let from = offset.min(data.len());
        let open = from + memchr(b'"', &data[from..])?;
        let close = open + 1 + memchr(b'"', &data[open + 1..])?;
        Some((open + 1, close))
    }

    pub fn eat_string(data: &[u8], offset: usize) -> usize {
        match string_bounds(data, offset) {
            Some((_, close)) => close + 1,
            None => data.len(),
        }
    }

    pub fn get_string_value(data: &[u8], offset: usize) -> (usize, String) {
        match string_bounds(data, offset) {
            Some((start, close)) => (
                close + 1,
                String::from_utf8_lossy(&data[start..close]).into_owned(),
            ),
            None => (data.len(), String::new()),
        }
    }

    pub fn get_string_value_by_key(data: &[u8], from: usize, key: &str) -> Option<String> {
        let needle = format!("\"{key}\":");
        let at = memchr::memmem::find(&data[from.min(data.len())..], needle.as_bytes())?;
        let after = from + at + needle.len();
        let (_, value) = get_string_value(data, after);
        if value.is_empty() { None } else { Some(value) }
    }
}

pub struct DubboDecoder;

impl ProtocolDecoder for DubboDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Dubbo
    }

    fn match_mode(&self) -> MatchMode {
        MatchMode::ById
    }

    fn fast_fail(&self, data: &[u8], direction: MessageDirection) -> bool {
        if data.len() < 3 || data[..2] != MAGIC {
            return true;
        }
        let is_request = data[2] & FLAG_REQUEST != 0;
        is_request != (direction == MessageDirection::Request)
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        if data.len() < HEADER_LEN {
            return if data.len() >= 2 && data[..2] != MAGIC {
                Verdict::Reject
            } else {
                Verdict::NeedMore
            };
        }
        if data[..2] != MAGIC {
            return Verdict::Reject;
        }

        let mut r = ByteReader::new(&data[2..HEADER_LEN]);
        let flag = r.read_u8().unwrap_or(0);
        let status = r.read_u8().unwrap_or(0);
        let request_id = r.read_u64_be().unwrap_or(0);
        let body_len = r.read_u32_be().unwrap_or(0) as usize;
        if body_len > MAX_BODY {
            return Verdict::Reject;
        }
        if data.len() < HEADER_LEN + body_len {
            return Verdict::NeedMore;
        }
        let body = &data[HEADER_LEN..HEADER_LEN + body_len];

        msg.put_int(REQUEST_ID, request_id as i64);
        msg.correlation_id = Some(request_id as i64);

        if flag & FLAG_EVENT != 0 {
            // Heartbeat; stays out of request/response matching.
            msg.put_bool(EVENT, true);
            msg.control = true;
            return Verdict::Matched {
                consumed: HEADER_LEN + body_len,
            };
        }

        match msg.direction {
            MessageDirection::Request => {
                let serialization = flag & SERIAL_MASK;
                let (service, method) = match serialization {
                    SERIAL_HESSIAN2 => request_body_strings(
                        body,
                        hessian2::get_string_value,
                        hessian2::get_string_value_by_key,
                    ),
                    SERIAL_FASTJSON => request_body_strings(
                        body,
                        fastjson::get_string_value,
                        fastjson::get_string_value_by_key,
                    ),
                    _ => (None, None),
                };
                if let Some(service) = service {
                    msg.put_str(SERVICE, service);
                }
                if let Some(method) = method {
                    msg.put_str(METHOD, method);
                }
            }
            MessageDirection::Response => {
                msg.put_int(ERROR_CODE, status as i64);
                msg.is_error = status != STATUS_OK;
            }
        }

        Verdict::Matched {
            consumed: HEADER_LEN + body_len,
        }
    }
}

/// A request body opens with four strings: protocol version, service
/// path, service version, method name. Falls back to the `path`
/// attachment when the positional scan comes up empty.
fn request_body_strings(
    body: &[u8],
    get_string: fn(&[u8], usize) -> (usize, String),
    get_by_key: fn(&[u8], usize, &str) -> Option<String>,
) -> (Option<String>, Option<String>) {
    let (o1, _protocol_version) = get_string(body, 0);
    let (o2, service) = get_string(body, o1);
    let (o3, _service_version) = get_string(body, o2);
    let (_, method) = get_string(body, o3);

    let service = if service.is_empty() {
        get_by_key(body, 0, "path")
    } else {
        Some(service)
    };
    let method = (!method.is_empty()).then_some(method);
    (service, method)
}
