//! Self-describing wire values.
//!
//! Every value starts with a one byte tag; variable length kinds follow
//! with a big-endian u32 length and the payload. The encoding is strictly
//! positional, so a frame is simply two encoded values back to back.

use crate::error::CodecError;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const TAG_ABSENT: u8 = 0x00;
pub const TAG_TEXT: u8 = 0x01;
pub const TAG_BYTES: u8 = 0x02;
pub const TAG_BUFFER: u8 = 0x03;
pub const TAG_SEQUENCE: u8 = 0x04;
pub const TAG_STRUCTURED: u8 = 0x05;

/// Default upper bound for a single length field, 16 MiB.
pub const DEFAULT_VALUE_CEILING: usize = 16 * 1024 * 1024;

/// A dynamically typed wire value.
///
/// The two byte kinds are deliberately distinct: `Bytes` round-trips an
/// opaque payload, `Buffer` one that originated from the peer's framing
/// layer. The codec never conflates them, so a value decodes to exactly
/// the kind it was encoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Absent,
    Text(String),
    Bytes(Vec<u8>),
    Buffer(Vec<u8>),
    Sequence(Vec<Value>),
    /// JSON payload, rendered as a text blob on the wire.
    Structured(serde_json::Value),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    /// Numbers have no tag of their own; the wire renders them as
    /// structured JSON, the way the original protocol does.
    pub fn number(n: u32) -> Value {
        Value::Structured(serde_json::Value::from(n))
    }

    /// Encode any serializable payload as a structured value.
    pub fn structured<T: Serialize>(payload: &T) -> Result<Value, CodecError> {
        Ok(Value::Structured(serde_json::to_value(payload)?))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Structured(serde_json::Value::Number(n)) => {
                n.as_u64().and_then(|n| u32::try_from(n).ok())
            }
            _ => None,
        }
    }

    /// Deserialize a structured value into a typed payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Value::Structured(json) => Ok(serde_json::from_value(json.clone())?),
            other => Err(CodecError::BadHeader(format!(
                "expected structured value, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Absent => "absent",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Buffer(_) => "buffer",
            Value::Sequence(_) => "sequence",
            Value::Structured(_) => "structured",
        }
    }
}

pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Absent => buf.put_u8(TAG_ABSENT),
        Value::Text(s) => {
            buf.put_u8(TAG_TEXT);
            buf.put_u32(s.len() as u32);
            buf.put(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32(b.len() as u32);
            buf.put(b.as_slice());
        }
        Value::Buffer(b) => {
            buf.put_u8(TAG_BUFFER);
            buf.put_u32(b.len() as u32);
            buf.put(b.as_slice());
        }
        Value::Sequence(items) => {
            buf.put_u8(TAG_SEQUENCE);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Structured(json) => {
            let rendered = json.to_string();
            buf.put_u8(TAG_STRUCTURED);
            buf.put_u32(rendered.len() as u32);
            buf.put(rendered.as_bytes());
        }
    }
}

/// Decode one value with the default length ceiling.
pub fn decode_value(src: &mut BytesMut) -> Result<Value, CodecError> {
    decode_value_bounded(src, DEFAULT_VALUE_CEILING)
}

pub fn decode_value_bounded(src: &mut BytesMut, ceiling: usize) -> Result<Value, CodecError> {
    if !src.has_remaining() {
        return Err(CodecError::Truncated);
    }

    match src.get_u8() {
        TAG_ABSENT => Ok(Value::Absent),
        TAG_TEXT => {
            let payload = take_payload(src, ceiling)?;
            Ok(Value::Text(String::from_utf8(payload)?))
        }
        TAG_BYTES => Ok(Value::Bytes(take_payload(src, ceiling)?)),
        TAG_BUFFER => Ok(Value::Buffer(take_payload(src, ceiling)?)),
        TAG_SEQUENCE => {
            let count = take_length(src, ceiling)?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value_bounded(src, ceiling)?);
            }
            Ok(Value::Sequence(items))
        }
        TAG_STRUCTURED => {
            let payload = take_payload(src, ceiling)?;
            let text = String::from_utf8(payload)?;
            Ok(Value::Structured(serde_json::from_str(&text)?))
        }
        tag => Err(CodecError::UnknownTag(tag)),
    }
}

fn take_length(src: &mut BytesMut, ceiling: usize) -> Result<usize, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated);
    }

    let len = src.get_u32() as usize;
    if len > ceiling {
        return Err(CodecError::Oversize { size: len, ceiling });
    }

    Ok(len)
}

fn take_payload(src: &mut BytesMut, ceiling: usize) -> Result<Vec<u8>, CodecError> {
    let len = take_length(src, ceiling)?;
    if src.remaining() < len {
        return Err(CodecError::Truncated);
    }

    Ok(src.split_to(len).to_vec())
}
