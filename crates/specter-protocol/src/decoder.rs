use specter_core::event::MessageDirection;
use specter_core::message::{PayloadMessage, Protocol};

/// How a protocol pairs requests with responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Responses answer requests in order (HTTP/1.x pipelining, MySQL,
    /// Redis).
    Fifo,
    /// Responses carry the request's correlation id (DNS, Kafka, Dubbo,
    /// RocketMQ) and may arrive out of order.
    ById,
}

/// Outcome of a parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// One complete message was decoded and its attributes written.
    /// `consumed` is how many bytes of the buffer it covered; anything
    /// after that belongs to the next message (pipelining).
    Matched { consumed: usize },
    /// Definitively not this protocol.
    Reject,
    /// The buffer ends mid-message; retry once more bytes arrive.
    NeedMore,
}

/// One application-protocol decoder.
///
/// Decoders are stateless: connection state (partial buffers, the
/// protocol lock) lives in the tracker, so a single decoder instance is
/// shared by every lane.
pub trait ProtocolDecoder: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn match_mode(&self) -> MatchMode {
        MatchMode::Fifo
    }

    /// Cheap pre-check on length and magic bytes. Returns `true` when
    /// the payload cannot be this protocol. Must be O(1) and must not
    /// touch the message.
    fn fast_fail(&self, data: &[u8], direction: MessageDirection) -> bool;

    /// Attempt to decode one message from `msg.data`, writing extracted
    /// attributes onto `msg`.
    fn parse(&self, msg: &mut PayloadMessage) -> Verdict;
}
