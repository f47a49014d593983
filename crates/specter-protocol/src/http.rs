//! HTTP/1.x request and status lines plus the headers the pipeline
//! cares about. Bodies are never retained; `Content-Length` is read only
//! to frame the message so a pipelined successor is not swallowed.

use memchr::memmem;
use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{ProtocolDecoder, Verdict};

pub const METHOD: &str = "http.method";
pub const URL: &str = "http.url";
pub const STATUS_CODE: &str = "http.status_code";
pub const CONTENT_TYPE: &str = "http.content_type";
pub const HOST: &str = "http.host";
pub const USER_AGENT: &str = "http.user_agent";
pub const TRACE_ID: &str = "trace_id";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 64 * 1024;

const METHODS: [&[u8]; 9] = [
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"TRACE", b"CONNECT",
];

fn starts_with_method(data: &[u8]) -> bool {
    METHODS
        .iter()
        .any(|m| data.len() > m.len() && data.starts_with(m) && data[m.len()] == b' ')
}

pub struct HttpDecoder;

impl ProtocolDecoder for HttpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn fast_fail(&self, data: &[u8], direction: MessageDirection) -> bool {
        match direction {
            MessageDirection::Request => !starts_with_method(data),
            MessageDirection::Response => !data.starts_with(b"HTTP/1."),
        }
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        let head_end = match memmem::find(&data, HEADER_TERMINATOR) {
            Some(at) => at,
            None if data.len() > MAX_HEADER_BYTES => return Verdict::Reject,
            // The probe capped the capture; no more bytes are coming.
            None if msg.truncated => data.len(),
            None => return Verdict::NeedMore,
        };

        let mut lines = data[..head_end].split(|&b| b == b'\n').map(trim_cr);
        let Some(start_line) = lines.next() else {
            return Verdict::Reject;
        };

        match msg.direction {
            MessageDirection::Request => {
                if !parse_request_line(start_line, msg) {
                    return Verdict::Reject;
                }
            }
            MessageDirection::Response => {
                if !parse_status_line(start_line, msg) {
                    return Verdict::Reject;
                }
            }
        }

        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        for line in lines {
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = line[..colon].trim_ascii();
            let value = String::from_utf8_lossy(line[colon + 1..].trim_ascii());
            match name.to_ascii_lowercase().as_slice() {
                b"host" => msg.put_str(HOST, value),
                b"user-agent" => msg.put_str(USER_AGENT, value),
                b"content-type" => msg.put_str(CONTENT_TYPE, value),
                b"content-length" => content_length = value.trim().parse().ok(),
                b"transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
                b"traceparent" => {
                    // 00-<trace-id>-<span-id>-<flags>
                    if let Some(trace_id) = value.split('-').nth(1) {
                        msg.put_str(TRACE_ID, trace_id);
                    }
                }
                b"x-b3-traceid" => msg.put_str(TRACE_ID, value),
                _ => {}
            }
        }

        let body_start = (head_end + HEADER_TERMINATOR.len()).min(data.len());
        let consumed = if chunked {
            // Chunk framing is not tracked; treat the rest of the burst
            // as body.
            data.len()
        } else {
            match (content_length, msg.direction) {
                (Some(len), _) => (body_start + len).min(data.len()),
                (None, MessageDirection::Request) => body_start,
                // Without a length the response body runs to close.
                (None, MessageDirection::Response) => data.len(),
            }
        };

        Verdict::Matched { consumed }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_request_line(line: &[u8], msg: &mut PayloadMessage) -> bool {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let (Some(method), Some(url)) = (parts.next(), parts.next()) else {
        return false;
    };
    if !METHODS.contains(&method) {
        return false;
    }
    if let Some(version) = parts.next()
        && !version.starts_with(b"HTTP/")
    {
        return false;
    }
    msg.put_str(METHOD, String::from_utf8_lossy(method));
    msg.put_str(URL, String::from_utf8_lossy(url));
    true
}

fn parse_status_line(line: &[u8], msg: &mut PayloadMessage) -> bool {
    if !line.starts_with(b"HTTP/1.") {
        return false;
    }
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let _version = parts.next();
    let Some(status) = parts
        .next()
        .and_then(|s| String::from_utf8_lossy(s).parse::<u16>().ok())
    else {
        return false;
    };
    if !(100..=599).contains(&status) {
        return false;
    }
    msg.put_int(STATUS_CODE, status as i64);
    msg.is_error = status >= 400;
    true
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use specter_core::event::{Endpoint, FiveTuple, Transport};

    use super::*;

    fn msg(data: &[u8], direction: MessageDirection) -> PayloadMessage {
        let key = FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 80),
            transport: Transport::Tcp,
        }
        .key();
        PayloadMessage::new(Bytes::copy_from_slice(data), direction, 0, key)
    }

    #[test]
    fn test_parses_request_line_and_headers() {
        let raw = b"GET /x?q=1 HTTP/1.1\r\nHost: a\r\nUser-Agent: curl/8\r\n\r\n";
        let mut m = msg(raw, MessageDirection::Request);
        let verdict = HttpDecoder.parse(&mut m);

        assert_eq!(
            verdict,
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.str_attr(METHOD), Some("GET"));
        assert_eq!(m.str_attr(URL), Some("/x?q=1"));
        assert_eq!(m.str_attr(HOST), Some("a"));
        assert_eq!(m.str_attr(USER_AGENT), Some("curl/8"));
        assert!(!m.is_error);
    }

    #[test]
    fn test_parses_status_line() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut m = msg(raw, MessageDirection::Response);
        assert_eq!(
            HttpDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.int_attr(STATUS_CODE), Some(200));
        assert!(!m.is_error);
    }

    #[test]
    fn test_status_400_and_up_is_error() {
        let raw = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
        let mut m = msg(raw, MessageDirection::Response);
        assert!(matches!(HttpDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.int_attr(STATUS_CODE), Some(503));
        assert!(m.is_error);
    }

    #[test]
    fn test_incomplete_headers_need_more() {
        let mut m = msg(b"GET /x HTTP/1.1\r\nHost: a\r\n", MessageDirection::Request);
        assert_eq!(HttpDecoder.parse(&mut m), Verdict::NeedMore);
    }

    #[test]
    fn test_truncated_capture_is_still_done() {
        let mut m = msg(b"GET /x HTTP/1.1\r\nHost: a", MessageDirection::Request);
        m.truncated = true;
        assert_eq!(HttpDecoder.parse(&mut m), Verdict::Matched { consumed: 24 });
        assert_eq!(m.str_attr(METHOD), Some("GET"));
    }

    #[test]
    fn test_fast_fail() {
        let d = HttpDecoder;
        assert!(!d.fast_fail(b"GET / HTTP/1.1\r\n", MessageDirection::Request));
        assert!(!d.fast_fail(b"HTTP/1.1 200 OK\r\n", MessageDirection::Response));
        assert!(d.fast_fail(b"GETX / HTTP/1.1", MessageDirection::Request));
        assert!(d.fast_fail(b"*1\r\n$4\r\nPING\r\n", MessageDirection::Request));
        assert!(d.fast_fail(b"SSH-2.0-OpenSSH", MessageDirection::Response));
    }

    #[test]
    fn test_pipelined_requests_frame_separately() {
        let first = b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut raw = first.to_vec();
        raw.extend_from_slice(b"GET /b HTTP/1.1\r\nHost: a\r\n\r\n");

        let mut m = msg(&raw, MessageDirection::Request);
        assert_eq!(
            HttpDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: first.len()
            }
        );
        assert_eq!(m.str_attr(URL), Some("/a"));
    }

    #[test]
    fn test_request_body_counts_toward_consumed() {
        let raw = b"POST /s HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        let mut m = msg(raw, MessageDirection::Request);
        // Only part of the body has arrived; headers are enough to be
        // done and the framing consumes what is present.
        assert_eq!(
            HttpDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
    }

    #[test]
    fn test_trace_id_from_traceparent() {
        let raw = b"GET / HTTP/1.1\r\ntraceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01\r\n\r\n";
        let mut m = msg(raw, MessageDirection::Request);
        assert!(matches!(HttpDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(
            m.str_attr(TRACE_ID),
            Some("0af7651916cd43dd8448eb211c80319c")
        );
    }
}
