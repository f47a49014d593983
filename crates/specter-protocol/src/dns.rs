//! DNS queries and answers. Questions yield the domain; responses add
//! the resolved A/AAAA addresses and the response code. Matching is by
//! transaction id, not FIFO order. Over TCP the message carries a
//! 2-byte length prefix (RFC 1035 §4.2.2).

use std::net::{Ipv4Addr, Ipv6Addr};

use specter_core::event::{MessageDirection, Transport};
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{MatchMode, ProtocolDecoder, Verdict};
use crate::reader::ByteReader;

pub const ID: &str = "dns.id";
pub const DOMAIN: &str = "dns.domain";
pub const IP: &str = "dns.ip";
pub const RCODE: &str = "dns.rcode";

const HEADER_SIZE: usize = 12;
const MAX_MESSAGE_SIZE: usize = 8192;
const MAX_NUM_RR: u16 = 25;
const MAX_OPCODE: u16 = 2;
const MAX_RCODE: u16 = 5;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

/// Read a possibly-compressed domain name starting at `offset`.
/// Returns the dotted name and the offset just past it in the original
/// (non-pointer) byte sequence.
fn read_name(frame: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *frame.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            let lo = *frame.get(pos + 1)? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = (len & 0x3f) << 8 | lo;
            jumps += 1;
            if jumps > 8 {
                return None;
            }
            continue;
        }
        if len & 0xc0 != 0 {
            return None;
        }
        let label = frame.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > 255 {
            return None;
        }
        pos += 1 + len;
    }

    Some((name, end.unwrap_or(pos)))
}

fn skip_name(frame: &[u8], offset: usize) -> Option<usize> {
    read_name(frame, offset).map(|(_, end)| end)
}

pub struct DnsDecoder;

impl ProtocolDecoder for DnsDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Dns
    }

    fn match_mode(&self) -> MatchMode {
        MatchMode::ById
    }

    fn fast_fail(&self, data: &[u8], _direction: MessageDirection) -> bool {
        data.len() < HEADER_SIZE || data.len() > MAX_MESSAGE_SIZE + 2
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();

        let (frame, consumed) = match msg.key.transport() {
            Transport::Udp => (&data[..], data.len()),
            Transport::Tcp => {
                let mut r = ByteReader::new(&data);
                let Some(frame_len) = r.read_u16_be() else {
                    return Verdict::NeedMore;
                };
                let frame_len = frame_len as usize;
                if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&frame_len) {
                    return Verdict::Reject;
                }
                match r.read_bytes(frame_len) {
                    Some(frame) => (frame, 2 + frame_len),
                    None => return Verdict::NeedMore,
                }
            }
        };
        if frame.len() < HEADER_SIZE {
            return Verdict::Reject;
        }

        let mut r = ByteReader::new(frame);
        let id = r.read_u16_be().unwrap_or(0);
        let flags = r.read_u16_be().unwrap_or(0);
        let qdcount = r.read_u16_be().unwrap_or(0);
        let ancount = r.read_u16_be().unwrap_or(0);
        let nscount = r.read_u16_be().unwrap_or(0);
        let arcount = r.read_u16_be().unwrap_or(0);

        let qr_response = flags & 0x8000 != 0;
        let opcode = (flags >> 11) & 0x0f;
        let rcode = flags & 0x0f;

        if opcode > MAX_OPCODE || rcode > MAX_RCODE || qdcount == 0 {
            return Verdict::Reject;
        }
        let total_rr = qdcount as u32 + ancount as u32 + nscount as u32 + arcount as u32;
        if total_rr > MAX_NUM_RR as u32 {
            return Verdict::Reject;
        }
        if qr_response != (msg.direction == MessageDirection::Response) {
            return Verdict::Reject;
        }

        msg.put_int(ID, id as i64);
        msg.correlation_id = Some(id as i64);

        let mut pos = HEADER_SIZE;
        for i in 0..qdcount {
            let Some((domain, after_name)) = read_name(frame, pos) else {
                // A datagram is the whole message unless the probe
                // capped it, so a short question section is malformed.
                if msg.truncated {
                    break;
                }
                return Verdict::Reject;
            };
            if i == 0 {
                msg.put_str(DOMAIN, domain);
            }
            match after_name.checked_add(4) {
                Some(next) if next <= frame.len() => pos = next,
                _ => {
                    if msg.truncated {
                        break;
                    }
                    return Verdict::Reject;
                }
            }
        }

        if msg.direction == MessageDirection::Response {
            msg.put_int(RCODE, rcode as i64);
            msg.is_error = rcode > 0;

            let mut ips = Vec::new();
            for _ in 0..ancount {
                let Some(after_name) = skip_name(frame, pos) else {
                    break;
                };
                let mut rr = ByteReader::new(frame.get(after_name..).unwrap_or(&[]));
                let (Some(rtype), Some(_class), Some(_ttl), Some(rdlen)) = (
                    rr.read_u16_be(),
                    rr.read_u16_be(),
                    rr.read_u32_be(),
                    rr.read_u16_be(),
                ) else {
                    break;
                };
                let Some(rdata) = rr.read_bytes(rdlen as usize) else {
                    break;
                };
                match rtype {
                    TYPE_A if rdata.len() == 4 => {
                        let octets: [u8; 4] = rdata.try_into().unwrap();
                        ips.push(Ipv4Addr::from(octets).to_string());
                    }
                    TYPE_AAAA if rdata.len() == 16 => {
                        let octets: [u8; 16] = rdata.try_into().unwrap();
                        ips.push(Ipv6Addr::from(octets).to_string());
                    }
                    _ => {}
                }
                pos = after_name + rr.pos();
            }
            if !ips.is_empty() {
                msg.put_str(IP, ips.join(","));
            }
        }

        Verdict::Matched { consumed }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use specter_core::event::{Endpoint, FiveTuple};

    use super::*;

    fn msg(data: &[u8], direction: MessageDirection, transport: Transport) -> PayloadMessage {
        let key = FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 53),
            transport,
        }
        .key();
        PayloadMessage::new(Bytes::copy_from_slice(data), direction, 0, key)
    }

    fn header(id: u16, flags: u16, qd: u16, an: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&qd.to_be_bytes());
        out.extend_from_slice(&an.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // nscount, arcount
        out
    }

    fn question(domain: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for label in domain {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // class IN
        out
    }

    #[test]
    fn test_a_query() {
        let mut raw = header(0x1234, 0x0100, 1, 0);
        raw.extend(question(&["example", "com"]));
        let mut m = msg(&raw, MessageDirection::Request, Transport::Udp);

        assert_eq!(
            DnsDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.str_attr(DOMAIN), Some("example.com"));
        assert_eq!(m.int_attr(ID), Some(0x1234));
        assert_eq!(m.correlation_id, Some(0x1234));
    }

    #[test]
    fn test_a_response_with_compressed_answer() {
        let mut raw = header(0x1234, 0x8180, 1, 1);
        raw.extend(question(&["example", "com"]));
        // Answer name is a pointer back to the question at offset 12.
        raw.extend_from_slice(&[0xc0, 0x0c]);
        raw.extend_from_slice(&TYPE_A.to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&300u32.to_be_bytes());
        raw.extend_from_slice(&4u16.to_be_bytes());
        raw.extend_from_slice(&[93, 184, 216, 34]);

        let mut m = msg(&raw, MessageDirection::Response, Transport::Udp);
        assert!(matches!(DnsDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.str_attr(DOMAIN), Some("example.com"));
        assert_eq!(m.str_attr(IP), Some("93.184.216.34"));
        assert_eq!(m.int_attr(RCODE), Some(0));
        assert!(!m.is_error);
    }

    #[test]
    fn test_nxdomain_is_error() {
        let mut raw = header(0x1234, 0x8183, 1, 0);
        raw.extend(question(&["nope", "example", "com"]));
        let mut m = msg(&raw, MessageDirection::Response, Transport::Udp);

        assert!(matches!(DnsDecoder.parse(&mut m), Verdict::Matched { .. }));
        assert_eq!(m.int_attr(RCODE), Some(3));
        assert!(m.is_error);
    }

    #[test]
    fn test_rejects_bad_opcode_and_rcode() {
        // opcode 7
        let mut raw = header(1, 0x3800, 1, 0);
        raw.extend(question(&["a"]));
        let mut m = msg(&raw, MessageDirection::Request, Transport::Udp);
        assert_eq!(DnsDecoder.parse(&mut m), Verdict::Reject);

        // rcode 14 on a response
        let mut raw = header(1, 0x800e, 1, 0);
        raw.extend(question(&["a"]));
        let mut m = msg(&raw, MessageDirection::Response, Transport::Udp);
        assert_eq!(DnsDecoder.parse(&mut m), Verdict::Reject);
    }

    #[test]
    fn test_rejects_zero_questions() {
        let raw = header(1, 0x0100, 0, 0);
        let mut m = msg(&raw, MessageDirection::Request, Transport::Udp);
        assert_eq!(DnsDecoder.parse(&mut m), Verdict::Reject);
    }

    #[test]
    fn test_qr_bit_must_match_direction() {
        let mut raw = header(1, 0x8180, 1, 0);
        raw.extend(question(&["a"]));
        let mut m = msg(&raw, MessageDirection::Request, Transport::Udp);
        assert_eq!(DnsDecoder.parse(&mut m), Verdict::Reject);
    }

    #[test]
    fn test_tcp_length_prefix() {
        let mut inner = header(0x0042, 0x0100, 1, 0);
        inner.extend(question(&["example", "com"]));
        let mut raw = (inner.len() as u16).to_be_bytes().to_vec();
        raw.extend_from_slice(&inner);

        // Split mid-frame: need more.
        let mut m = msg(&raw[..8], MessageDirection::Request, Transport::Tcp);
        assert_eq!(DnsDecoder.parse(&mut m), Verdict::NeedMore);

        let mut m = msg(&raw, MessageDirection::Request, Transport::Tcp);
        assert_eq!(
            DnsDecoder.parse(&mut m),
            Verdict::Matched {
                consumed: raw.len()
            }
        );
        assert_eq!(m.str_attr(DOMAIN), Some("example.com"));
    }
}
