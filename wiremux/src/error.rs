//! Error kinds of the multiplexer and how they propagate.
//!
//! Handler code reports failures through `anyhow`; the server half
//! classifies them into the two wire error shapes. Everything the caller
//! side can observe is a [`WiremuxError`].

use std::fmt;
use wiremux_codec::{CodecError, RemoteError, Value};

/// Name carried by the deferred-request timeout error.
pub const UNKNOWN_CHANNEL: &str = "Unknown channel";

#[derive(Debug)]
pub enum WiremuxError {
    /// The call was cancelled locally, or issued on a disposed client.
    Cancelled,
    /// The peer's handler failed with an error-shaped payload.
    Remote(RemoteError),
    /// The peer's handler failed with a raw payload.
    RemoteObject(Value),
    /// A frame could not be decoded. Fatal for the connection.
    Framing(CodecError),
    /// The transport failed underneath us.
    Transport(std::io::Error),
    /// A service-proxy member was used against its declared shape.
    Member(String),
}

impl WiremuxError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WiremuxError::Cancelled)
    }

    /// True when the peer reported the deferred-request timeout.
    pub fn is_unknown_channel(&self) -> bool {
        matches!(self, WiremuxError::Remote(err) if err.name == UNKNOWN_CHANNEL)
    }
}

impl fmt::Display for WiremuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WiremuxError::Cancelled => write!(f, "cancelled"),
            WiremuxError::Remote(err) => write!(f, "remote error: {err}"),
            WiremuxError::RemoteObject(body) => write!(f, "remote error payload: {body:?}"),
            WiremuxError::Framing(err) => write!(f, "framing error: {err}"),
            WiremuxError::Transport(err) => write!(f, "transport error: {err}"),
            WiremuxError::Member(text) => write!(f, "{text}"),
        }
    }
}

impl std::error::Error for WiremuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WiremuxError::Remote(err) => Some(err),
            WiremuxError::Framing(err) => Some(err),
            WiremuxError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for WiremuxError {
    fn from(e: CodecError) -> Self {
        WiremuxError::Framing(e)
    }
}

impl From<std::io::Error> for WiremuxError {
    fn from(e: std::io::Error) -> Self {
        WiremuxError::Transport(e)
    }
}

/// Handler escape hatch: fail a call with a raw payload instead of the
/// error shape. The server forwards the value verbatim.
#[derive(Debug)]
pub struct ErrorObject(pub Value);

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error payload: {:?}", self.0)
    }
}

impl std::error::Error for ErrorObject {}
