//! Outbound traffic for one session.
//!
//! Everything a connection sends travels through a single unbounded queue so
//! that event/response ordering is decided at enqueue time; the writer task
//! stamps event sequence numbers just before each frame hits the wire.

use outpost_protocol::EventFrame;
use outpost_protocol::Frame;
use outpost_protocol::OutboundEvent;
use outpost_protocol::ResponseFrame;

/// One item on a session's outgoing queue.
#[derive(Debug)]
pub(crate) enum OutgoingMessage {
    Response(ResponseFrame),
    Event(OutboundEvent),
    /// Terminate the connection after flushing, e.g. after a failed
    /// `connect`.
    Close { code: u16, reason: &'static str },
}

/// Stamps per-session sequence numbers onto events, in queue order.
#[derive(Debug, Default)]
pub(crate) struct SequenceStamper {
    seq: u64,
}

impl SequenceStamper {
    /// Convert a queue item into the frame to write, if any.
    pub(crate) fn frame_for(&mut self, message: OutgoingMessage) -> Option<Frame> {
        match message {
            OutgoingMessage::Response(res) => Some(Frame::Res(res)),
            OutgoingMessage::Event(event) => {
                self.seq += 1;
                Some(Frame::Event(EventFrame {
                    event: event.event,
                    payload: event.payload,
                    seq: self.seq,
                }))
            }
            OutgoingMessage::Close { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn events_get_strictly_increasing_seq() {
        let mut stamper = SequenceStamper::default();
        for expected in 1..=3u64 {
            let frame = stamper
                .frame_for(OutgoingMessage::Event(OutboundEvent::new(
                    "tick",
                    json!({}),
                )))
                .unwrap();
            let Frame::Event(event) = frame else {
                panic!("expected event frame");
            };
            assert_eq!(event.seq, expected);
        }
    }

    #[test]
    fn responses_do_not_consume_seq() {
        let mut stamper = SequenceStamper::default();
        stamper.frame_for(OutgoingMessage::Response(ResponseFrame::success(
            outpost_protocol::RequestId::Integer(1),
            json!({}),
        )));
        let frame = stamper
            .frame_for(OutgoingMessage::Event(OutboundEvent::new("tick", json!({}))))
            .unwrap();
        let Frame::Event(event) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event.seq, 1);
    }
}
