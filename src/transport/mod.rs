//! Wire framing for bridge messages.
//!
//! Every message travels as one frame: a 4-byte big-endian length followed by
//! exactly that many bytes of UTF-8 JSON. The length prefix always tells us
//! where a frame ends, so a frame with a broken body is consumed and reported
//! without desynchronising the stream.

pub mod protocol;

pub use protocol::{ConnectionState, ForwarderState, Message, Request};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::ProtocolError;
use protocol::MESSAGE_KINDS;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Result of a single [`decode`] attempt.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes buffered for a full frame yet.
    Incomplete,
    /// A complete, well-formed message.
    Message(Message),
    /// A complete frame whose payload could not be decoded.
    Malformed(ProtocolError),
}

/// Serialize a message and prepend its length.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message).map_err(ProtocolError::InvalidJson)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::TooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to take one frame off the front of `buf`.
///
/// Returns the outcome and how many bytes it consumed. `Incomplete` never
/// consumes anything; the caller keeps the bytes and retries once more data
/// has arrived.
pub fn decode(buf: &[u8]) -> (Decoded, usize) {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return (Decoded::Incomplete, 0);
    };
    let mut len_bytes = [0u8; HEADER_LEN];
    len_bytes.copy_from_slice(header);
    let len = u32::from_be_bytes(len_bytes) as usize;

    let Some(payload) = buf.get(HEADER_LEN..HEADER_LEN + len) else {
        return (Decoded::Incomplete, 0);
    };

    let outcome = match parse_payload(payload) {
        Ok(message) => Decoded::Message(message),
        Err(e) => Decoded::Malformed(e),
    };
    (outcome, HEADER_LEN + len)
}

fn parse_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    };
    if !MESSAGE_KINDS.contains(&kind.as_str()) {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ProtocolError::UnknownType { kind, id });
    }

    serde_json::from_value(value).map_err(ProtocolError::InvalidJson)
}

/// Accumulating receive buffer shared by both ends of the bridge.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// `Some(Err(_))` is a malformed frame that has already been dropped from
    /// the buffer; keep calling to drain whatever follows it.
    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        let (outcome, consumed) = decode(&self.buf);
        self.buf.drain(..consumed);
        match outcome {
            Decoded::Incomplete => None,
            Decoded::Message(message) => Some(Ok(message)),
            Decoded::Malformed(e) => Some(Err(e)),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Encode a message and write the whole frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
) -> std::io::Result<()> {
    let frame = encode(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn samples() -> Vec<Message> {
        vec![
            Message::Ping { id: "r1".into() },
            Message::Pong {
                id: "r1".into(),
                timestamp: 1_700_000_000.25,
                state: ForwarderState::Idle,
            },
            Message::Execute {
                id: "r2".into(),
                code: "print('héllo')\n".into(),
            },
            Message::ExecuteFile {
                id: "r3".into(),
                file: "/tmp/script.py".into(),
            },
            Message::GetState { id: "r4".into() },
            Message::Result {
                id: "r2".into(),
                success: false,
                output: None,
                error: Some("boom".into()),
                logs: Some("line 1".into()),
            },
            Message::State {
                id: "r4".into(),
                state: ForwarderState::Executing,
                timestamp: 3.5,
            },
            Message::Error {
                id: "r5".into(),
                error: "Unknown message type: nope".into(),
            },
        ]
    }

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = u32::try_from(payload.len()).unwrap().to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn roundtrip_every_kind() {
        for message in samples() {
            let frame = encode(&message).unwrap();
            let (outcome, consumed) = decode(&frame);
            assert_eq!(consumed, frame.len());
            match outcome {
                Decoded::Message(decoded) => assert_eq!(decoded, message),
                other => panic!("expected message, got {other:?}"),
            }
        }
    }

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = encode(&Message::Ping { id: "r1".into() }).unwrap();
        let payload = &frame[HEADER_LEN..];
        assert_eq!(&frame[..HEADER_LEN], &(payload.len() as u32).to_be_bytes());
        let json: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["id"], "r1");
    }

    #[test]
    fn result_serializes_absent_fields_as_null() {
        let frame = encode(&Message::Result {
            id: "r2".into(),
            success: true,
            output: Some("2".into()),
            error: None,
            logs: None,
        })
        .unwrap();
        let json: Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["success"], true);
        assert!(json["error"].is_null());
    }

    #[test]
    fn incomplete_consumes_nothing() {
        let frame = encode(&Message::GetState { id: "abc".into() }).unwrap();
        for cut in [0, 1, 3, HEADER_LEN, frame.len() - 1] {
            let (outcome, consumed) = decode(&frame[..cut]);
            assert!(matches!(outcome, Decoded::Incomplete), "cut at {cut}");
            assert_eq!(consumed, 0);
        }
    }

    #[test]
    fn split_at_every_boundary_yields_one_message() {
        let message = Message::Execute {
            id: "split".into(),
            code: "x = 1\ny = x + 1".into(),
        };
        let frame = encode(&message).unwrap();

        for split in 0..=frame.len() {
            let mut buffer = FrameBuffer::new();
            let mut decoded = Vec::new();
            for piece in [&frame[..split], &frame[split..]] {
                buffer.extend(piece);
                while let Some(next) = buffer.next_frame() {
                    decoded.push(next.unwrap());
                }
            }
            assert_eq!(decoded, vec![message.clone()], "split at {split}");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn two_frames_in_one_read_drain_in_order() {
        let a = Message::Ping { id: "a".into() };
        let b = Message::Execute {
            id: "b".into(),
            code: "1+1".into(),
        };
        let mut bytes = encode(&a).unwrap();
        bytes.extend(encode(&b).unwrap());

        let (first, used) = decode(&bytes);
        assert!(matches!(first, Decoded::Message(ref m) if *m == a));
        let (second, rest) = decode(&bytes[used..]);
        assert!(matches!(second, Decoded::Message(ref m) if *m == b));
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn malformed_frames_are_consumed_and_stream_continues() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&raw_frame(&[0xff, 0xfe, 0xfd]));
        buffer.extend(&raw_frame(b"{not json"));
        buffer.extend(&encode(&Message::Ping { id: "ok".into() }).unwrap());

        assert!(matches!(
            buffer.next_frame(),
            Some(Err(ProtocolError::InvalidUtf8(_)))
        ));
        assert!(matches!(
            buffer.next_frame(),
            Some(Err(ProtocolError::InvalidJson(_)))
        ));
        assert_eq!(
            buffer.next_frame().unwrap().unwrap(),
            Message::Ping { id: "ok".into() }
        );
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn unknown_type_keeps_request_id() {
        let (outcome, _) = decode(&raw_frame(br#"{"type":"reboot","id":"r9"}"#));
        match outcome {
            Decoded::Malformed(ProtocolError::UnknownType { kind, id }) => {
                assert_eq!(kind, "reboot");
                assert_eq!(id, "r9");
            }
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn missing_id_and_code_default_to_empty() {
        let (outcome, _) = decode(&raw_frame(br#"{"type":"execute"}"#));
        match outcome {
            Decoded::Message(Message::Execute { id, code }) => {
                assert!(id.is_empty());
                assert!(code.is_empty());
            }
            other => panic!("expected execute, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_frame_writes_decodable_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = Message::GetState { id: "w1".into() };
        write_frame(&mut client, &message).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&received);
        assert_eq!(buffer.next_frame().unwrap().unwrap(), message);
    }
}
