//! Redis serialization protocol (RESP). Commands arrive as arrays of
//! bulk strings; the decoder recovers the command word and first key and
//! flags `-ERR` style responses.

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const COMMAND: &str = "redis.command";
pub const KEY: &str = "redis.key";
pub const ERROR: &str = "redis.error";

const MAX_DEPTH: usize = 4;
const MAX_ELEMENTS: u64 = 1024;
const MAX_BULK_LEN: u64 = 16 * 1024 * 1024;

/// One parsed RESP value. Bulk payloads borrow from the input.
#[derive(Debug, PartialEq)]
enum Value<'a> {
    Simple(&'a [u8]),
    Error(&'a [u8]),
    Integer(i64),
    Bulk(Option<&'a [u8]>),
    Array(Vec<Value<'a>>),
}

enum Step<T> {
    Done(T),
    NeedMore,
    Bad,
}

fn read_line<'a>(r: &mut ByteReader<'a>) -> Step<&'a [u8]> {
    match r.read_until(b'\n') {
        Some(line) => match line.strip_suffix(b"\r") {
            Some(stripped) => Step::Done(stripped),
            None => Step::Bad,
        },
        None => Step::NeedMore,
    }
}

fn read_decimal(line: &[u8]) -> Option<i64> {
    if line.is_empty() {
        return None;
    }
    let text = std::str::from_utf8(line).ok()?;
    text.parse().ok()
}

fn read_value<'a>(r: &mut ByteReader<'a>, depth: usize) -> Step<Value<'a>> {
    if depth > MAX_DEPTH {
        return Step::Bad;
    }
    let Some(marker) = r.read_u8() else {
        return Step::NeedMore;
    };
    let line = match read_line(r) {
        Step::Done(line) => line,
        Step::NeedMore => return Step::NeedMore,
        Step::Bad => return Step::Bad,
    };
    match marker {
        b'+' => Step::Done(Value::Simple(line)),
        b'-' => Step::Done(Value::Error(line)),
        b':' => match read_decimal(line) {
            Some(v) => Step::Done(Value::Integer(v)),
            None => Step::Bad,
        },
        b'$' => {
            let Some(len) = read_decimal(line) else {
                return Step::Bad;
            };
            if len == -1 {
                return Step::Done(Value::Bulk(None));
            }
            if len < 0 || len as u64 > MAX_BULK_LEN {
                return Step::Bad;
            }
            let Some(payload) = r.read_bytes(len as usize) else {
                return Step::NeedMore;
            };
            match r.read_bytes(2) {
                Some(b"\r\n") => Step::Done(Value::Bulk(Some(payload))),
                Some(_) => Step::Bad,
                None => Step::NeedMore,
            }
        }
        b'*' => {
            let Some(count) = read_decimal(line) else {
                return Step::Bad;
            };
            if count == -1 {
                return Step::Done(Value::Array(Vec::new()));
            }
            if count < 0 || count as u64 > MAX_ELEMENTS {
                return Step::Bad;
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match read_value(r, depth + 1) {
                    Step::Done(v) => items.push(v),
                    Step::NeedMore => return Step::NeedMore,
                    Step::Bad => return Step::Bad,
                }
            }
            Step::Done(Value::Array(items))
        }
        _ => Step::Bad,
    }
}

pub struct RedisDecoder;

impl ProtocolDecoder for RedisDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Redis
    }

    fn fast_fail(&self, data: &[u8], _direction: MessageDirection) -> bool {
        !matches!(data.first(), Some(b'+' | b'-' | b':' | b'$' | b'*'))
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        let mut r = ByteReader::new(&data);
        let value = match read_value(&mut r, 0) {
            Step::Done(v) => v,
            Step::NeedMore => return Verdict::NeedMore,
            Step::Bad => return Verdict::Reject,
        };
        let consumed = r.pos();

        match (&value, msg.direction) {
            (Value::Array(items), MessageDirection::Request) => {
                let mut words = items.iter().filter_map(|v| match v {
                    Value::Bulk(Some(payload)) => Some(*payload),
                    _ => None,
                });
                let Some(command) = words.next() else {
                    return Verdict::Reject;
                };
                msg.put_str(
                    COMMAND,
                    String::from_utf8_lossy(command).to_ascii_uppercase(),
                );
                if let Some(key) = words.next() {
                    msg.put_str(KEY, String::from_utf8_lossy(key));
                }
            }
            (Value::Error(text), _) => {
                msg.put_str(ERROR, String::from_utf8_lossy(text));
                msg.is_error = true;
            }
            // Inline commands and non-array requests are not commands we
            // attribute; responses of any shape are fine.
            (_, MessageDirection::Response) => {}
            _ => return Verdict::Reject,
        }

        Verdict::Matched { consumed }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use specter_core::event::{Endpoint, FiveTuple, Transport};

    use super::*;

    fn msg(data: &[u8], direction: MessageDirection) -> PayloadMessage {
        let key = FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 6379),
            transport: Transport::Tcp,
        }
        .key();
        PayloadMessage::new(Bytes::copy_from_slice(data), direction, 0, key)
    }

    const SET_A_B: &[u8] = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n";

    #[test]
    fn test_command_and_key() {
        let mut m = msg(SET_A_B, MessageDirection::Request);
        assert_eq!(
            RedisDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: SET_A_B.len()
            }
        );
        assert_eq!(m.str_attr(COMMAND), Some("SET"));
        assert_eq!(m.str_attr(KEY), Some("a"));
    }

    #[test]
    fn test_every_split_point_needs_more() {
        for cut in 1..SET_A_B.len() {
            let mut m = msg(&SET_A_B[..cut], MessageDirection::Request);
            assert_eq!(
                RedisDecoder.parse(&mut m),
                Verdict::NeedMore,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_error_reply() {
        let mut m = msg(b"-ERR unknown command 'FOO'\r\n", MessageDirection::Response);
        assert!(matches!(RedisDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert!(m.is_error);
        assert_eq!(m.str_attr(ERROR), Some("ERR unknown command 'FOO'"));
    }

    #[test]
    fn test_simple_ok_reply() {
        let mut m = msg(b"+OK\r\n", MessageDirection::Response);
        assert_eq!(RedisDecoder.parse(&mut m), Verdict::Matched { consumed: 5 });
        assert!(!m.is_error);
    }

    #[test]
    fn test_pipelined_commands_frame_separately() {
        let mut raw = SET_A_B.to_vec();
        raw.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
        let mut m = msg(&raw, MessageDirection::Request);
        assert_eq!(
            RedisDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: SET_A_B.len()
            }
        );
    }

    #[test]
    fn test_bare_newline_rejected() {
        let mut m = msg(b"*1\n$4\nPING\n", MessageDirection::Request);
        assert_eq!(RedisDecoder.parse(&mut m), Verdict::Reject);
    }
}
