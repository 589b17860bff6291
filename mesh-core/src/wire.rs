//! Direct-channel framing: text messages are a JSON envelope with an explicit
//! `kind`; binary messages are always chunk payload.

use serde::{Deserialize, Serialize};

use crate::ids::TransferId;
use crate::protocol::TransferDescriptor;

/// Largest text frame accepted in either direction.
pub const MAX_TEXT_FRAME_LEN: usize = 64 * 1024;

/// One message as carried by the direct channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(s) => s.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded direct-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start(TransferDescriptor),
    Chunk(Vec<u8>),
    End(TransferDescriptor),
    Ack(TransferId),
    Heartbeat,
    Chat(String),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Envelope {
    Start { descriptor: TransferDescriptor },
    End { descriptor: TransferDescriptor },
    Ack { id: TransferId },
    Heartbeat,
    Chat { text: String },
}

/// Encode a frame into the message the channel should carry.
pub fn encode_frame(frame: Frame) -> Result<ChannelMessage, FrameEncodeError> {
    let envelope = match frame {
        Frame::Chunk(bytes) => return Ok(ChannelMessage::Binary(bytes)),
        Frame::Start(descriptor) => Envelope::Start { descriptor },
        Frame::End(descriptor) => Envelope::End { descriptor },
        Frame::Ack(id) => Envelope::Ack { id },
        Frame::Heartbeat => Envelope::Heartbeat,
        Frame::Chat(text) => Envelope::Chat { text },
    };
    let text = serde_json::to_string(&envelope)?;
    if text.len() > MAX_TEXT_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(text.len()));
    }
    Ok(ChannelMessage::Text(text))
}

/// Error encoding a frame (json or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("text frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one channel message into a frame.
pub fn decode_frame(msg: ChannelMessage) -> Result<Frame, FrameDecodeError> {
    let text = match msg {
        ChannelMessage::Binary(bytes) => return Ok(Frame::Chunk(bytes)),
        ChannelMessage::Text(text) => text,
    };
    if text.len() > MAX_TEXT_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(text.len()));
    }
    let envelope: Envelope = serde_json::from_str(&text)?;
    Ok(match envelope {
        Envelope::Start { descriptor } => Frame::Start(descriptor),
        Envelope::End { descriptor } => Frame::End(descriptor),
        Envelope::Ack { id } => Frame::Ack(id),
        Envelope::Heartbeat => Frame::Heartbeat,
        Envelope::Chat { text } => Frame::Chat(text),
    })
}

/// Error decoding a frame (too large, malformed or unknown kind).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("text frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TransferDescriptor {
        TransferDescriptor {
            id: TransferId::from("t-1"),
            name: "report.pdf".into(),
            byte_size: 1024,
            mime_type: "application/pdf".into(),
            last_modified: 5,
        }
    }

    #[test]
    fn control_frames_are_tagged_text() {
        let msg = encode_frame(Frame::Start(descriptor())).unwrap();
        let ChannelMessage::Text(text) = &msg else {
            panic!("start must be text");
        };
        assert!(text.starts_with(r#"{"kind":"start""#));
        assert_eq!(decode_frame(msg).unwrap(), Frame::Start(descriptor()));

        let ack = encode_frame(Frame::Ack(TransferId::from("t-1"))).unwrap();
        assert_eq!(ack, ChannelMessage::Text(r#"{"kind":"ack","id":"t-1"}"#.into()));
        assert_eq!(
            encode_frame(Frame::Heartbeat).unwrap(),
            ChannelMessage::Text(r#"{"kind":"heartbeat"}"#.into())
        );
    }

    #[test]
    fn chat_that_looks_like_a_control_tag_stays_chat() {
        for text in ["START:{}", "HB", "ACK:t-1", r#"{"kind":"ack","id":"x"}"#] {
            let msg = encode_frame(Frame::Chat(text.into())).unwrap();
            assert_eq!(decode_frame(msg).unwrap(), Frame::Chat(text.into()));
        }
    }

    #[test]
    fn binary_is_always_chunk() {
        let msg = encode_frame(Frame::Chunk(vec![1, 2, 3])).unwrap();
        assert_eq!(msg, ChannelMessage::Binary(vec![1, 2, 3]));
        assert_eq!(
            decode_frame(ChannelMessage::Binary(b"{\"kind\":\"heartbeat\"}".to_vec())).unwrap(),
            Frame::Chunk(b"{\"kind\":\"heartbeat\"}".to_vec())
        );
    }

    #[test]
    fn untagged_or_unknown_text_is_rejected() {
        assert!(matches!(
            decode_frame(ChannelMessage::Text("hello".into())),
            Err(FrameDecodeError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(ChannelMessage::Text(r#"{"kind":"nack"}"#.into())),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_text_rejected_both_ways() {
        let big = "x".repeat(MAX_TEXT_FRAME_LEN + 1);
        assert!(matches!(
            encode_frame(Frame::Chat(big.clone())),
            Err(FrameEncodeError::TooLarge(_))
        ));
        assert!(matches!(
            decode_frame(ChannelMessage::Text(big)),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }
}
