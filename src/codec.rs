//! # Audio Frame Codec
//!
//! Packs and unpacks the frames exchanged on the `/ws/voice-agent` socket.
//! The WebSocket transport already tells binary and text frames apart, so the
//! codec never adds its own tagging to audio:
//!
//! - **Binary frames** carry raw audio and map to [`Frame::AudioChunk`].
//! - **Text frames** carry UTF-8 and map either to a [`Frame::Control`]
//!   (exact tokens `start`, `stop`, `error`) or to a [`Frame::TextMessage`].
//!
//! ## Escaping
//! A chat message whose text is exactly a control token (or that begins with
//! the escape character `\`) is sent with a leading `\`, so a decoded frame
//! always re-encodes to the same wire text.

use actix_web::web::Bytes;
use thiserror::Error;

/// Prefix marking a text frame as literal chat text.
const ESCAPE: char = '\\';

/// Control instructions recognized on text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Start,
    Stop,
    Error,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Start => "start",
            ControlKind::Stop => "stop",
            ControlKind::Error => "error",
        }
    }

    /// Match a text payload against the control vocabulary (exact, case-sensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "start" => Some(ControlKind::Start),
            "stop" => Some(ControlKind::Stop),
            "error" => Some(ControlKind::Error),
            _ => None,
        }
    }
}

/// A discrete unit of wire data. Only this module builds frames from bytes
/// or turns them back into bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AudioChunk(Bytes),
    TextMessage(String),
    Control(ControlKind),
}

/// A raw inbound transport message, before UTF-8 validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(Bytes),
}

/// An encoded outbound message, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Binary(Bytes),
    Text(String),
}

impl From<Encoded> for WireMessage {
    fn from(encoded: Encoded) -> Self {
        match encoded {
            Encoded::Binary(data) => WireMessage::Binary(data),
            Encoded::Text(text) => WireMessage::Text(Bytes::from(text)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("text frame is not valid UTF-8: {0}")]
    InvalidText(String),
}

/// Encode a frame for the transport.
pub fn encode(frame: &Frame) -> Encoded {
    match frame {
        Frame::AudioChunk(data) => Encoded::Binary(data.clone()),
        Frame::Control(kind) => Encoded::Text(kind.as_str().to_string()),
        Frame::TextMessage(text) => {
            if ControlKind::from_token(text).is_some() || text.starts_with(ESCAPE) {
                Encoded::Text(format!("{ESCAPE}{text}"))
            } else {
                Encoded::Text(text.clone())
            }
        }
    }
}

/// Decode one transport message.
///
/// Returns `Ok(None)` for an empty binary frame, which carries nothing and is
/// ignored rather than treated as an error.
pub fn decode(message: WireMessage) -> Result<Option<Frame>, DecodeError> {
    match message {
        WireMessage::Binary(data) if data.is_empty() => Ok(None),
        WireMessage::Binary(data) => Ok(Some(Frame::AudioChunk(data))),
        WireMessage::Text(data) => {
            let text = std::str::from_utf8(&data)
                .map_err(|e| DecodeError::InvalidText(e.to_string()))?;
            Ok(Some(decode_text(text)))
        }
    }
}

fn decode_text(text: &str) -> Frame {
    if let Some(kind) = ControlKind::from_token(text) {
        return Frame::Control(kind);
    }
    match text.strip_prefix(ESCAPE) {
        Some(literal) => Frame::TextMessage(literal.to_string()),
        None => Frame::TextMessage(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        decode(encode(&frame).into())
            .expect("decodes")
            .expect("non-empty frame")
    }

    #[test]
    fn test_round_trip_preserves_every_frame_kind() {
        let frames = vec![
            Frame::AudioChunk(Bytes::from_static(&[1, 2, 3, 4])),
            Frame::TextMessage("what is the status of my claim?".to_string()),
            Frame::TextMessage("start".to_string()),
            Frame::TextMessage("\\stop".to_string()),
            Frame::TextMessage(String::new()),
            Frame::Control(ControlKind::Start),
            Frame::Control(ControlKind::Stop),
            Frame::Control(ControlKind::Error),
        ];

        for frame in frames {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_control_tokens_decode_to_control_frames() {
        let frame = decode(WireMessage::Text(Bytes::from_static(b"stop"))).unwrap();
        assert_eq!(frame, Some(Frame::Control(ControlKind::Stop)));

        // Tokens are exact; anything else is chat text
        let frame = decode(WireMessage::Text(Bytes::from_static(b"Stop please"))).unwrap();
        assert_eq!(frame, Some(Frame::TextMessage("Stop please".to_string())));
    }

    #[test]
    fn test_literal_control_word_is_escaped_on_the_wire() {
        let encoded = encode(&Frame::TextMessage("start".to_string()));
        assert_eq!(encoded, Encoded::Text("\\start".to_string()));
    }

    #[test]
    fn test_empty_binary_frame_is_ignored() {
        assert_eq!(decode(WireMessage::Binary(Bytes::new())), Ok(None));
    }

    #[test]
    fn test_malformed_utf8_is_rejected() {
        let result = decode(WireMessage::Text(Bytes::from_static(&[0x66, 0xff, 0xfe])));
        assert!(matches!(result, Err(DecodeError::InvalidText(_))));
    }
}
