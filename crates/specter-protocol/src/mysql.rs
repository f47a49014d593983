//! MySQL client/server protocol: command packets on the request side,
//! OK / ERR / EOF / result-set headers on the response side. The decoder
//! reads just far enough to classify the packet and pull out the query
//! text or error details.

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const SQL: &str = "sql";
pub const COMMAND: &str = "mysql.command";
pub const SCHEMA: &str = "mysql.schema";
pub const ERROR_CODE: &str = "mysql.error_code";
pub const ERROR_MSG: &str = "mysql.error_msg";
pub const AFFECTED_ROWS: &str = "mysql.affected_rows";
pub const COLUMN_COUNT: &str = "mysql.column_count";
pub const SERVER_VERSION: &str = "mysql.server_version";

const HEADER_LEN: usize = 4;
// Handshake v10 greeting, the first server-to-client packet.
const GREETING_VERSION: u8 = 0x0a;

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;

const RESP_OK: u8 = 0x00;
const RESP_EOF: u8 = 0xfe;
const RESP_ERR: u8 = 0xff;

/// Some 8.0.x servers prefix returned strings with 0x00 0x01.
fn packet_text(payload: &[u8]) -> String {
    if payload.len() > 2 && payload[0] == 0 && payload[1] == 1 {
        String::from_utf8_lossy(&payload[2..]).into_owned()
    } else {
        String::from_utf8_lossy(payload).into_owned()
    }
}

fn command_name(command: u8) -> Option<&'static str> {
    match command {
        COM_QUIT => Some("quit"),
        COM_INIT_DB => Some("init_db"),
        COM_QUERY => Some("query"),
        COM_PING => Some("ping"),
        COM_STMT_PREPARE => Some("stmt_prepare"),
        COM_STMT_EXECUTE => Some("stmt_execute"),
        _ => None,
    }
}

pub struct MysqlDecoder;

impl ProtocolDecoder for MysqlDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Mysql
    }

    fn fast_fail(&self, data: &[u8], direction: MessageDirection) -> bool {
        if data.len() < HEADER_LEN + 1 {
            return true;
        }
        let frame_len = u32::from_le_bytes([data[0], data[1], data[2], 0]) as usize;
        if frame_len == 0 {
            return true;
        }
        match direction {
            // Command packets reset the sequence counter.
            MessageDirection::Request => data[3] != 0 || command_name(data[4]).is_none(),
            // Sequence zero on the server side is only the greeting.
            MessageDirection::Response => data[3] == 0 && data[4] != GREETING_VERSION,
        }
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        let mut r = ByteReader::new(&data);
        let (Some(frame_len), Some(seq)) = (r.read_u24_le(), r.read_u8()) else {
            return Verdict::NeedMore;
        };
        let frame_len = frame_len as usize;
        if frame_len == 0 {
            return Verdict::Reject;
        }
        if r.remaining() < frame_len {
            return Verdict::NeedMore;
        }
        let payload = &data[HEADER_LEN..HEADER_LEN + frame_len];

        match msg.direction {
            MessageDirection::Request => parse_command(payload, msg),
            MessageDirection::Response if seq == 0 => parse_greeting(payload, data.len(), msg),
            MessageDirection::Response => parse_response(payload, frame_len, &data, msg),
        }
    }
}

/// Server greeting: protocol version byte, then the NUL-terminated
/// server version string. Locks identification but is not a response to
/// anything.
fn parse_greeting(payload: &[u8], data_len: usize, msg: &mut PayloadMessage) -> Verdict {
    if payload[0] != GREETING_VERSION {
        return Verdict::Reject;
    }
    let mut r = ByteReader::new(&payload[1..]);
    let Some(version) = r.read_until(0) else {
        return Verdict::Reject;
    };
    msg.put_str(SERVER_VERSION, String::from_utf8_lossy(version));
    msg.control = true;
    Verdict::Matched { consumed: data_len }
}

fn parse_command(payload: &[u8], msg: &mut PayloadMessage) -> Verdict {
    let command = payload[0];
    let Some(name) = command_name(command) else {
        return Verdict::Reject;
    };
    msg.put_str(COMMAND, name);

    match command {
        COM_QUERY | COM_STMT_PREPARE => {
            msg.put_str(SQL, packet_text(&payload[1..]).trim().to_string());
        }
        COM_INIT_DB => {
            msg.put_str(SCHEMA, packet_text(&payload[1..]));
        }
        COM_STMT_EXECUTE => {
            let mut r = ByteReader::new(&payload[1..]);
            if let Some(statement_id) = r.read_u32_le() {
                msg.put_int("mysql.statement_id", statement_id as i64);
            }
        }
        _ => {}
    }

    Verdict::Matched {
        consumed: HEADER_LEN + payload.len(),
    }
}

fn parse_response(
    payload: &[u8],
    frame_len: usize,
    data: &[u8],
    msg: &mut PayloadMessage,
) -> Verdict {
    let mut r = ByteReader::new(payload);
    let Some(kind) = r.read_u8() else {
        return Verdict::NeedMore;
    };

    match kind {
        RESP_OK => {
            let affected = r.read_lenenc_uint().flatten().unwrap_or(0);
            let _last_insert_id = r.read_lenenc_uint();
            msg.put_str(COMMAND, "ok");
            msg.put_int(AFFECTED_ROWS, affected as i64);
        }
        RESP_ERR => {
            let Some(code) = r.read_u16_le() else {
                return Verdict::NeedMore;
            };
            // '#' marks a 5-byte SQL state before the message.
            if r.peek_u8() == Some(b'#') {
                let _ = r.skip(6);
            }
            msg.put_str(COMMAND, "err");
            msg.put_int(ERROR_CODE, code as i64);
            msg.put_str(ERROR_MSG, packet_text(r.rest()));
            msg.is_error = true;
        }
        // A real EOF packet is at most 9 bytes; 0xfe also begins
        // lenenc-encoded row counts in larger frames.
        RESP_EOF if frame_len < 9 => {
            msg.put_str(COMMAND, "eof");
        }
        _ => {
            // Result-set header: the payload is a single length-encoded
            // column count.
            let mut r = ByteReader::new(payload);
            let Some(Some(columns)) = r.read_lenenc_uint() else {
                return Verdict::Reject;
            };
            msg.put_str(COMMAND, "result_set");
            msg.put_int(COLUMN_COUNT, columns as i64);
        }
    }

    // Column definitions, rows and the closing OK/EOF ride in the same
    // burst; classification only needs the first packet.
    Verdict::Matched {
        consumed: data.len(),
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
            dst: Endpoint::v4(10, 0, 0, 2, 3306),
            transport: Transport::Tcp,
        }
        .key();
        PayloadMessage::new(Bytes::copy_from_slice(data), direction, 0, key)
    }

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_com_query() {
        let raw = frame(0, b"\x03SELECT 1 FROM no_table");
        let mut m = msg(&raw, MessageDirection::Request);

        assert_eq!(
            MysqlDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.str_attr(COMMAND), Some("query"));
        assert_eq!(m.str_attr(SQL), Some("SELECT 1 FROM no_table"));
    }

    #[test]
    fn test_err_packet() {
        // code 1146 (0x047a), sql state 42S02
        let mut payload = vec![0xff, 0x7a, 0x04];
        payload.extend_from_slice(b"#42S02Table 'no_table' doesn't exist");
        let raw = frame(1, &payload);
        let mut m = msg(&raw, MessageDirection::Response);

        assert!(matches!(MysqlDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.int_attr(ERROR_CODE), Some(1146));
        assert_eq!(m.str_attr(ERROR_MSG), Some("Table 'no_table' doesn't exist"));
        assert!(m.is_error);
    }

    #[test]
    fn test_ok_packet_affected_rows() {
        // affected_rows=5 (lenenc), last_insert_id=0, status, warnings
        let raw = frame(1, b"\x00\x05\x00\x02\x00\x00\x00");
        let mut m = msg(&raw, MessageDirection::Response);

        assert!(matches!(MysqlDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.int_attr(AFFECTED_ROWS), Some(5));
        assert!(!m.is_error);
    }

    #[test]
    fn test_result_set_header() {
        let raw = frame(1, b"\x03");
        let mut m = msg(&raw, MessageDirection::Response);
        assert!(matches!(MysqlDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.int_attr(COLUMN_COUNT), Some(3));
    }

    #[test]
    fn test_split_frame_needs_more() {
        let raw = frame(0, b"\x03SELECT 1");
        let mut m = msg(&raw[..6], MessageDirection::Request);
        assert_eq!(MysqlDecoder.parse(&mut m), Verdict::NeedMore);
    }

    #[test]
    fn test_greeting_is_control() {
        let mut payload = vec![GREETING_VERSION];
        payload.extend_from_slice(b"8.0.33\x00");
        payload.extend_from_slice(&[0u8; 20]); // thread id, auth data, ...
        let raw = frame(0, &payload);

        let mut m = msg(&raw, MessageDirection::Response);
        assert!(!MysqlDecoder.fast_fail(&raw, MessageDirection::Response));
        assert!(matches!(MysqlDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert!(m.control);
        assert_eq!(m.str_attr(SERVER_VERSION), Some("8.0.33"));
    }

    #[test]
    fn test_fast_fail() {
        let d = MysqlDecoder;
        // Unknown command byte.
        let raw = frame(0, b"\x63hello");
        assert!(d.fast_fail(&raw, MessageDirection::Request));
        // Request frames must start the sequence at zero.
        let raw = frame(3, b"\x03SELECT 1");
        assert!(d.fast_fail(&raw, MessageDirection::Request));
        let raw = frame(0, b"\x03SELECT 1");
        assert!(!d.fast_fail(&raw, MessageDirection::Request));
        assert!(d.fast_fail(b"GET / HTTP/1.1\r\n", MessageDirection::Request));
    }
}
