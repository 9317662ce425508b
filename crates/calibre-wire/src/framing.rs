//! Control-frame codec.
//!
//! Wire form: `<decimal ascii length>[<opcode>,<json object>]` where the
//! length counts the payload bytes starting at the leading `[`.  The codec is
//! sans-io: encoding produces the complete byte packet, decoding takes the
//! payload after the transport has read exactly `length` bytes.

use crate::opcode::Opcode;
use serde::Serialize;
use thiserror::Error;

/// Payloads above this size are rejected as malformed.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// A decoded control frame: opcode plus its JSON argument object.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub opcode: Opcode,
    pub args: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("invalid length prefix")]
    BadLengthPrefix,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(usize),
    #[error("payload is not a `[opcode,args]` pair")]
    BadShape,
    #[error("opcode {0} is not in the protocol")]
    UnknownOpcode(i64),
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a complete packet: length prefix + `[opcode,args]` payload.
pub fn encode<T: Serialize>(opcode: Opcode, args: &T) -> Result<Vec<u8>, FramingError> {
    let body = serde_json::to_string(args)?;
    let payload = format!("[{},{}]", opcode.as_wire(), body);
    let mut packet = payload.len().to_string().into_bytes();
    packet.extend_from_slice(payload.as_bytes());
    Ok(packet)
}

/// Decode a payload (the bytes counted by the length prefix, starting at `[`).
///
/// The opcode is the integer before the first comma; everything from there to
/// the matching final `]` is the JSON argument object.
pub fn decode(payload: &[u8]) -> Result<Frame, FramingError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FramingError::Oversized(payload.len()));
    }
    let text = std::str::from_utf8(payload).map_err(|_| FramingError::NotUtf8)?;
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or(FramingError::BadShape)?;
    let (op_text, args_text) = inner.split_once(',').ok_or(FramingError::BadShape)?;
    let op_value: i64 = op_text.trim().parse().map_err(|_| FramingError::BadShape)?;
    let opcode = Opcode::from_wire(op_value).ok_or(FramingError::UnknownOpcode(op_value))?;
    let args = serde_json::from_str(args_text)?;
    Ok(Frame { opcode, args })
}
