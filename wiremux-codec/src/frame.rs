//! Request and response frames.
//!
//! A frame is two values back to back: a header sequence and a body. The
//! first header integer selects the shape; correlation ids tie responses
//! back to the requests that caused them.

use crate::error::CodecError;
use crate::value::{decode_value_bounded, encode_value, Value, DEFAULT_VALUE_CEILING};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

pub const REQUEST_CALL: u32 = 100;
pub const REQUEST_CANCEL: u32 = 101;
pub const REQUEST_SUBSCRIBE: u32 = 102;
pub const REQUEST_UNSUBSCRIBE: u32 = 103;

pub const RESPONSE_INITIALIZE: u32 = 200;
pub const RESPONSE_CALL_OK: u32 = 201;
pub const RESPONSE_CALL_ERR: u32 = 202;
pub const RESPONSE_CALL_ERR_OBJ: u32 = 203;
pub const RESPONSE_EVENT_FIRE: u32 = 204;

/// Correlation id, unique per originating client, never reused.
pub type RequestId = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Call {
        id: RequestId,
        channel: String,
        method: String,
        arg: Value,
    },
    Cancel {
        id: RequestId,
    },
    Subscribe {
        id: RequestId,
        channel: String,
        event: String,
        arg: Value,
    },
    Unsubscribe {
        id: RequestId,
    },
}

impl Request {
    pub fn id(&self) -> RequestId {
        match self {
            Request::Call { id, .. }
            | Request::Cancel { id }
            | Request::Subscribe { id, .. }
            | Request::Unsubscribe { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Initialize,
    CallOk { id: RequestId, body: Value },
    CallErr { id: RequestId, err: RemoteError },
    CallErrObj { id: RequestId, body: Value },
    EventFire { id: RequestId, body: Value },
}

/// A decoded frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// The error shape carried by a `CallErr` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Stack>,
}

/// Stack renderings seen on the wire: already split per line, or one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stack {
    Lines(Vec<String>),
    Text(String),
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> RemoteError {
        RemoteError {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> RemoteError {
        self.stack = Some(Stack::Text(stack.into()));
        self
    }

    /// Split-by-line stack representation, the shape senders put on the
    /// wire regardless of how the error was raised.
    pub fn normalized(mut self) -> RemoteError {
        if let Some(Stack::Text(text)) = self.stack {
            self.stack = Some(Stack::Lines(text.lines().map(str::to_owned).collect()));
        }
        self
    }

    pub fn stack_lines(&self) -> Vec<String> {
        match &self.stack {
            Some(Stack::Lines(lines)) => lines.clone(),
            Some(Stack::Text(text)) => text.lines().map(str::to_owned).collect(),
            None => vec![],
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

pub fn encode_request(buf: &mut BytesMut, request: &Request) {
    let (header, body) = match request {
        Request::Call {
            id,
            channel,
            method,
            arg,
        } => (
            vec![
                Value::number(REQUEST_CALL),
                Value::number(*id),
                Value::text(channel.clone()),
                Value::text(method.clone()),
            ],
            arg.clone(),
        ),
        Request::Cancel { id } => (
            vec![Value::number(REQUEST_CANCEL), Value::number(*id)],
            Value::Absent,
        ),
        Request::Subscribe {
            id,
            channel,
            event,
            arg,
        } => (
            vec![
                Value::number(REQUEST_SUBSCRIBE),
                Value::number(*id),
                Value::text(channel.clone()),
                Value::text(event.clone()),
            ],
            arg.clone(),
        ),
        Request::Unsubscribe { id } => (
            vec![Value::number(REQUEST_UNSUBSCRIBE), Value::number(*id)],
            Value::Absent,
        ),
    };

    encode_value(buf, &Value::Sequence(header));
    encode_value(buf, &body);
}

pub fn encode_response(buf: &mut BytesMut, response: &Response) {
    let (header, body) = match response {
        Response::Initialize => (vec![Value::number(RESPONSE_INITIALIZE)], Value::Absent),
        Response::CallOk { id, body } => (
            vec![Value::number(RESPONSE_CALL_OK), Value::number(*id)],
            body.clone(),
        ),
        Response::CallErr { id, err } => {
            let payload = serde_json::to_value(err).expect("remote error serializes");
            (
                vec![Value::number(RESPONSE_CALL_ERR), Value::number(*id)],
                Value::Structured(payload),
            )
        }
        Response::CallErrObj { id, body } => (
            vec![Value::number(RESPONSE_CALL_ERR_OBJ), Value::number(*id)],
            body.clone(),
        ),
        Response::EventFire { id, body } => (
            vec![Value::number(RESPONSE_EVENT_FIRE), Value::number(*id)],
            body.clone(),
        ),
    };

    encode_value(buf, &Value::Sequence(header));
    encode_value(buf, &body);
}

/// Decode one frame with the default ceiling.
pub fn decode_message(src: &mut BytesMut) -> Result<Message, CodecError> {
    decode_message_bounded(src, DEFAULT_VALUE_CEILING)
}

pub fn decode_message_bounded(src: &mut BytesMut, ceiling: usize) -> Result<Message, CodecError> {
    let header = match decode_value_bounded(src, ceiling)? {
        Value::Sequence(items) => items,
        other => {
            return Err(CodecError::BadHeader(format!(
                "header must be a sequence, got {}",
                other.kind_name()
            )))
        }
    };
    let body = decode_value_bounded(src, ceiling)?;

    let kind = header_u32(&header, 0)?;
    let message = match kind {
        REQUEST_CALL => Message::Request(Request::Call {
            id: header_u32(&header, 1)?,
            channel: header_text(&header, 2)?,
            method: header_text(&header, 3)?,
            arg: body,
        }),
        REQUEST_CANCEL => Message::Request(Request::Cancel {
            id: header_u32(&header, 1)?,
        }),
        REQUEST_SUBSCRIBE => Message::Request(Request::Subscribe {
            id: header_u32(&header, 1)?,
            channel: header_text(&header, 2)?,
            event: header_text(&header, 3)?,
            arg: body,
        }),
        REQUEST_UNSUBSCRIBE => Message::Request(Request::Unsubscribe {
            id: header_u32(&header, 1)?,
        }),
        RESPONSE_INITIALIZE => Message::Response(Response::Initialize),
        RESPONSE_CALL_OK => Message::Response(Response::CallOk {
            id: header_u32(&header, 1)?,
            body,
        }),
        RESPONSE_CALL_ERR => Message::Response(Response::CallErr {
            id: header_u32(&header, 1)?,
            err: body.parse()?,
        }),
        RESPONSE_CALL_ERR_OBJ => Message::Response(Response::CallErrObj {
            id: header_u32(&header, 1)?,
            body,
        }),
        RESPONSE_EVENT_FIRE => Message::Response(Response::EventFire {
            id: header_u32(&header, 1)?,
            body,
        }),
        unknown => {
            return Err(CodecError::BadHeader(format!("unknown frame type {unknown}")));
        }
    };

    Ok(message)
}

fn header_u32(header: &[Value], index: usize) -> Result<u32, CodecError> {
    header
        .get(index)
        .and_then(Value::as_u32)
        .ok_or_else(|| CodecError::BadHeader(format!("missing integer at position {index}")))
}

fn header_text(header: &[Value], index: usize) -> Result<String, CodecError> {
    header
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| CodecError::BadHeader(format!("missing string at position {index}")))
}

impl Request {
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, self);
        buf
    }
}

impl Response {
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_response(&mut buf, self);
        buf
    }
}
