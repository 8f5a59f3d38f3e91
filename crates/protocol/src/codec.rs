//! Channel framing.
//!
//! # Wire format
//!
//! ```text
//! CONTROL: one text message, a JSON object tagged by "type"
//! PAYLOAD: one binary message, raw chunk bytes, sent immediately
//!          after its `chunk` / `chunk-retry` record
//! ```
//!
//! The channel is ordered and reliable, so a payload always belongs to the
//! most recent chunk record (see [`crate::assembler`]).

use crate::messages::ControlMessage;

/// Upper bound for a single control record.
pub const MAX_CONTROL_MESSAGE_LEN: usize = 64 * 1024;

/// One message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Bytes this message occupies in the transport's send buffer.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Payload(Vec<u8>),
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control message too large: {0} bytes")]
    TooLarge(usize),
}

/// Serialises a control record into a text message.
pub fn encode_control(msg: &ControlMessage) -> Result<WireMessage, CodecError> {
    let json = serde_json::to_string(msg)?;
    if json.len() > MAX_CONTROL_MESSAGE_LEN {
        return Err(CodecError::TooLarge(json.len()));
    }
    Ok(WireMessage::Text(json))
}

/// Wraps chunk bytes into a binary message.
pub fn encode_payload(bytes: Vec<u8>) -> WireMessage {
    WireMessage::Binary(bytes)
}

/// Decodes one wire message.
pub fn decode(msg: WireMessage) -> Result<Frame, CodecError> {
    match msg {
        WireMessage::Text(text) => {
            if text.len() > MAX_CONTROL_MESSAGE_LEN {
                return Err(CodecError::TooLarge(text.len()));
            }
            Ok(Frame::Control(serde_json::from_str(&text)?))
        }
        WireMessage::Binary(bytes) => Ok(Frame::Payload(bytes)),
    }
}
