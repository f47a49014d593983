//! Fallback decoder for connections nothing else claims. Records the
//! payload size and a short hex preview; never rejects and never flags
//! an error.

use std::fmt::Write as _;

use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

use crate::decoder::{ProtocolDecoder, Verdict};

pub const SIZE: &str = "payload.size";
pub const PREVIEW: &str = "payload.preview";

const PREVIEW_BYTES: usize = 16;

pub struct GenericDecoder;

impl ProtocolDecoder for GenericDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Generic
    }

    fn fast_fail(&self, _data: &[u8], _direction: MessageDirection) -> bool {
        false
    }

    fn parse(&self, msg: &mut PayloadMessage) -> Verdict {
        let data = msg.data.clone();
        msg.put_int(SIZE, data.len() as i64);

        let head = &data[..data.len().min(PREVIEW_BYTES)];
        let mut preview = String::with_capacity(head.len() * 2);
        for byte in head {
            let _ = write!(preview, "{byte:02x}");
        }
        msg.put_str(PREVIEW, preview);

        Verdict::Matched {
            consumed: data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use specter_core::event::{Endpoint, FiveTuple, Transport};

    use super::*;

    #[test]
    fn test_consumes_everything_without_error() {
        let key = FiveTuple {
            src: Endpoint::v4(10, 0, 0, 1, 51234),
            dst: Endpoint::v4(10, 0, 0, 2, 4242),
            transport: Transport::Tcp,
        }
        .key();
        let payload = vec![0xab; 40];
        let mut m = PayloadMessage::new(
            Bytes::copy_from_slice(&payload),
            MessageDirection::Request,
            0,
            key,
        );

        assert_eq!(GenericDecoder.parse(&mut m), Verdict::Matched { consumed: 40 });
        assert_eq!(m.int_attr(SIZE), Some(40));
        assert_eq!(m.str_attr(PREVIEW), Some("ab".repeat(16).as_str()));
        assert!(!m.is_error);
    }
}
