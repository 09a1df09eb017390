use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::Error;
use super::message::Message;

/// Wire codec for the modem application's message API.
///
/// Frames are newline-delimited JSON objects. Decoding yields one
/// [`Message`] per line; blank lines are skipped. A malformed line is
/// surfaced as [`Error::MalformedMessage`] so the caller can log and
/// continue, leaving the stream intact for subsequent frames.
#[derive(Clone, Default)]
pub struct MessageCodec;

/// Upper bound on a single frame. Inbox responses are the largest frames
/// the application emits.
const MAX_FRAME_LENGTH: usize = 1024 * 1024;

impl MessageCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = match src.iter().position(|b| *b == b'\n') {
                Some(position) => position,
                None => {
                    if src.len() > MAX_FRAME_LENGTH {
                        // discard the runaway data so the stream can recover
                        src.clear();
                        return Err(Error::malformed(format!(
                            "frame exceeds {MAX_FRAME_LENGTH} bytes without terminator"
                        )));
                    }
                    // need more data to complete the line
                    return Ok(None);
                }
            };

            let line = src.split_to(newline);
            src.advance(1); // drop the newline

            let text = match std::str::from_utf8(&line) {
                Ok(text) => text.trim_end_matches('\r').trim(),
                Err(_) => return Err(Error::malformed("frame is not valid UTF-8")),
            };

            if text.is_empty() {
                continue;
            }

            return Message::decode(text).map(Some);
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.encode();
        dst.reserve(frame.len() + 1);
        dst.extend_from_slice(frame.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageKind;

    #[test]
    fn test_codec_round_trip() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::new();

        let message = Message::send_text("hello");
        codec.encode(message.clone(), &mut bytes).unwrap();

        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn test_codec_partial_frame() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::from(&br#"{"params":{},"type":"PING"#[..]);

        // no newline yet
        assert!(codec.decode(&mut bytes).unwrap().is_none());

        bytes.extend_from_slice(b"\",\"value\":\"\"}\r\n");
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Ping);
    }

    #[test]
    fn test_codec_skips_blank_lines() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::from(
            &b"\r\n\n{\"params\":{},\"type\":\"PING\",\"value\":\"\"}\n"[..],
        );
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Ping);
    }

    #[test]
    fn test_codec_malformed_line_is_error_not_poison() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::from(
            &b"garbage\n{\"params\":{},\"type\":\"PING\",\"value\":\"\"}\n"[..],
        );

        assert!(matches!(
            codec.decode(&mut bytes),
            Err(Error::MalformedMessage(_))
        ));
        // the stream remains usable for the next frame
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Ping);
    }

    #[test]
    fn test_codec_two_frames_one_read() {
        let mut codec = MessageCodec::new();
        let mut bytes = BytesMut::new();
        codec.encode(Message::of_kind(MessageKind::Ping), &mut bytes).unwrap();
        codec
            .encode(Message::of_kind(MessageKind::TxGetText), &mut bytes)
            .unwrap();

        assert_eq!(
            codec.decode(&mut bytes).unwrap().unwrap().kind,
            MessageKind::Ping
        );
        assert_eq!(
            codec.decode(&mut bytes).unwrap().unwrap().kind,
            MessageKind::TxGetText
        );
    }
}
