use std::fmt;

/// Errors raised while encoding or decoding wire data.
///
/// Any of these is fatal for the connection it was observed on: the stream
/// position is unknown after a bad frame, so callers are expected to
/// dispose the transport.
#[derive(Debug)]
pub enum CodecError {
    /// A value started with a tag byte the codec does not know.
    UnknownTag(u8),
    /// A declared length points past the end of the frame.
    Truncated,
    /// A declared length exceeds the configured ceiling.
    Oversize { size: usize, ceiling: usize },
    /// The header sequence did not match any request/response shape.
    BadHeader(String),
    /// A text payload was not valid UTF-8.
    Utf8(std::string::FromUtf8Error),
    /// A structured payload was not valid JSON.
    Json(serde_json::Error),
    /// The underlying stream failed.
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownTag(tag) => write!(f, "unknown value tag 0x{tag:02x}"),
            CodecError::Truncated => write!(f, "frame truncated"),
            CodecError::Oversize { size, ceiling } => {
                write!(f, "frame of {size} bytes exceeds ceiling of {ceiling}")
            }
            CodecError::BadHeader(text) => write!(f, "bad frame header: {text}"),
            CodecError::Utf8(e) => write!(f, "invalid utf-8 in text value: {e}"),
            CodecError::Json(e) => write!(f, "invalid structured value: {e}"),
            CodecError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Utf8(e) => Some(e),
            CodecError::Json(e) => Some(e),
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::string::FromUtf8Error> for CodecError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        CodecError::Utf8(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl From<CodecError> for std::io::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
